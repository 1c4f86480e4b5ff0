mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::MockFactory;
use session::{ExecutionStatus, InstallEvent, SessionConfig, SessionError};

async fn collect(mut stream: session::InstallStream) -> Vec<InstallEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn install_streams_progress_then_single_done() {
    let factory = Arc::new(MockFactory::new());
    let service = common::service(Arc::clone(&factory));
    let session = service.create_session("proj1", None).await.unwrap();

    let events = collect(service.install_package(&session.id, "Pandas").unwrap()).await;
    assert_eq!(
        events,
        vec![
            InstallEvent::Progress {
                message: "Collecting Pandas".into()
            },
            InstallEvent::Progress {
                message: "Successfully installed Pandas".into()
            },
            InstallEvent::Done {
                success: true,
                message: "installed pandas".into()
            },
        ]
    );

    let info = service.get_session(&session.id).unwrap();
    assert!(info.installed_packages.contains("pandas"));
}

#[tokio::test]
async fn installed_package_short_circuits() {
    let factory = Arc::new(MockFactory::new());
    let service = common::service(Arc::clone(&factory));
    let session = service.create_session("proj1", None).await.unwrap();

    collect(service.install_package(&session.id, "numpy").unwrap()).await;
    let events = collect(service.install_package(&session.id, "NumPy==1.26").unwrap()).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], InstallEvent::Done { success: true, .. }));
    assert_eq!(factory.activity.installs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_ends_with_unsuccessful_done() {
    let factory = Arc::new(MockFactory::new());
    let service = common::service(Arc::clone(&factory));
    let session = service.create_session("proj1", None).await.unwrap();

    let mut stream = service.install_package(&session.id, "broken").unwrap();
    let mut done = None;
    while let Some(event) = stream.next().await {
        assert!(done.is_none(), "event after Done: {event:?}");
        if let InstallEvent::Done { success, message } = event {
            done = Some((success, message));
        }
    }
    let (success, message) = done.unwrap();
    assert!(!success);
    assert!(message.contains("No matching distribution"), "{message}");
    assert!(stream.next().await.is_none());

    // Sandbox remains usable.
    let result = service
        .execute("proj1", "print:ok", Some(session.id.as_str()), None, None)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn unsupported_and_invalid_packages_are_rejected_without_backend() {
    let factory = Arc::new(MockFactory::new());
    let config = SessionConfig {
        unsupported_packages: vec!["tensorflow-gpu".into()],
        ..SessionConfig::default()
    };
    let service = common::service_with(Arc::clone(&factory), config);
    let session = service.create_session("proj1", None).await.unwrap();

    let done = service
        .install_package(&session.id, "tensorflow_gpu")
        .unwrap()
        .finish()
        .await;
    assert!(matches!(done, InstallEvent::Done { success: false, .. }));

    let done = service
        .install_package(&session.id, "--extra-index-url=http://x")
        .unwrap()
        .finish()
        .await;
    assert!(matches!(done, InstallEvent::Done { success: false, .. }));

    assert_eq!(factory.activity.installs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_is_lazy() {
    let factory = Arc::new(MockFactory::new());
    let service = common::service(Arc::clone(&factory));
    let session = service.create_session("proj1", None).await.unwrap();

    let stream = service.install_package(&session.id, "scipy").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.activity.installs.load(Ordering::SeqCst), 0);
    drop(stream);
    assert!(service.get_session(&session.id).unwrap().installed_packages.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn install_waits_for_running_script() {
    let factory = Arc::new(MockFactory::new());
    let service = Arc::new(common::service(Arc::clone(&factory)));
    let session = service.create_session("proj1", None).await.unwrap();

    let running = {
        let service = Arc::clone(&service);
        let id = session.id.clone();
        tokio::spawn(async move {
            service
                .execute("proj1", "sleep:100\nprint:done", Some(id.as_str()), None, None)
                .await
        })
    };
    common::wait_until(|| factory.activity.active() == 1).await;

    let done = service
        .install_package(&session.id, "polars")
        .unwrap()
        .finish()
        .await;
    assert!(matches!(done, InstallEvent::Done { success: true, .. }));
    assert_eq!(running.await.unwrap().unwrap().stdout, "done\n");
    assert_eq!(factory.activity.max_active(), 1);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let factory = Arc::new(MockFactory::new());
    let service = common::service(factory);
    let err = service.install_package("missing", "numpy").err().unwrap();
    assert!(matches!(err, SessionError::SessionNotFound(_)));
}
