use std::path::{Path, PathBuf};

/// Factory-level paths derived from the base directory.
pub struct FactoryPaths {
    base_dir: PathBuf,
}

impl FactoryPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn sandboxes(&self) -> PathBuf {
        self.base_dir.join("sandboxes")
    }

    pub fn sandbox(&self, id: &str) -> PathBuf {
        self.sandboxes().join(id)
    }
}

/// Per-sandbox paths: `<root>/work` is the script working directory,
/// `<root>/site-packages` receives installed packages.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    root: PathBuf,
    work: PathBuf,
}

impl SandboxPaths {
    pub fn new(root: PathBuf) -> Self {
        let work = root.join("work");
        Self { root, work }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn work(&self) -> &Path {
        &self.work
    }

    pub fn site_packages(&self) -> PathBuf {
        self.root.join("site-packages")
    }

    pub fn cells(&self) -> PathBuf {
        self.work.join(".cells")
    }

    pub fn cell_script(&self, request_id: &str) -> PathBuf {
        self.cells().join(format!("{request_id}.py"))
    }
}
