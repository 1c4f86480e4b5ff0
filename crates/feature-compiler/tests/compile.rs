use feature_compiler::{
    CompileError, FeatureParams, FeatureSpec, TransformKind, compile, compile_with_schema,
    validate,
};

fn housing_features() -> Vec<FeatureSpec> {
    vec![
        FeatureSpec::new("price_per_m2", TransformKind::Ratio, "price").with_secondary("area"),
        FeatureSpec::new("log_price_per_m2", TransformKind::Log, "price_per_m2"),
        FeatureSpec::new("rooms_z", TransformKind::Standardize, "rooms"),
        FeatureSpec::new("area_bin", TransformKind::Bin, "area").with_params(FeatureParams {
            bins: Some(4),
            ..Default::default()
        }),
        FeatureSpec::new("district_te", TransformKind::TargetEncode, "district")
            .with_target("price"),
    ]
}

#[test]
fn identical_input_gives_identical_output() {
    let features = housing_features();
    let first = compile(&features).unwrap();
    for _ in 0..10 {
        let again = compile(&features).unwrap();
        assert_eq!(again.source(), first.source());
        assert_eq!(again.digest(), first.digest());
    }
}

#[test]
fn blocks_follow_input_order() {
    let features = housing_features();
    let script = compile(&features).unwrap();
    let positions: Vec<usize> = features
        .iter()
        .enumerate()
        .map(|(i, f)| {
            script
                .source()
                .find(&format!("# [{i}] {}:", f.name))
                .unwrap_or_else(|| panic!("missing block for {}", f.name))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
}

#[test]
fn producer_before_consumer_validates_against_schema() {
    let producer = FeatureSpec::new("x", TransformKind::Square, "a");
    let consumer = FeatureSpec::new("log_x", TransformKind::Log, "x");

    let ok = compile_with_schema(&[producer.clone(), consumer.clone()], ["a"]);
    assert!(ok.is_ok());

    let err = compile_with_schema(&[consumer, producer], ["a"]).unwrap_err();
    assert_eq!(
        err,
        CompileError::UnknownColumn {
            feature: "log_x".into(),
            column: "x".into()
        }
    );
}

#[test]
fn without_schema_consumer_first_stays_first() {
    let producer = FeatureSpec::new("x", TransformKind::Square, "a");
    let consumer = FeatureSpec::new("log_x", TransformKind::Log, "x");
    let script = compile(&[consumer, producer]).unwrap();
    let src = script.source();
    assert!(src.find("# [0] log_x").unwrap() < src.find("# [1] x").unwrap());
}

#[test]
fn binary_transforms_require_secondary_column() {
    for transform in [
        TransformKind::Ratio,
        TransformKind::Difference,
        TransformKind::Product,
    ] {
        let err = compile(&[FeatureSpec::new("out", transform, "a")]).unwrap_err();
        assert_eq!(
            err,
            CompileError::MissingSecondaryColumn {
                feature: "out".into(),
                transform
            }
        );
    }
    let blank = FeatureSpec::new("out", TransformKind::Ratio, "a").with_secondary("  ");
    assert!(matches!(
        validate(&[blank]),
        Err(CompileError::MissingSecondaryColumn { .. })
    ));
}

#[test]
fn target_encoding_requires_target() {
    let err = compile(&[FeatureSpec::new("te", TransformKind::TargetEncode, "city")]).unwrap_err();
    assert_eq!(
        err,
        CompileError::MissingTargetColumn {
            feature: "te".into()
        }
    );
}

#[test]
fn rejects_bad_names_and_params() {
    assert_eq!(
        validate(&[
            FeatureSpec::new("ok", TransformKind::Log, "a"),
            FeatureSpec::new(" ", TransformKind::Log, "a"),
        ]),
        Err(CompileError::EmptyName { index: 1 })
    );
    assert!(matches!(
        validate(&[
            FeatureSpec::new("dup", TransformKind::Log, "a"),
            FeatureSpec::new("dup", TransformKind::Sqrt, "a"),
        ]),
        Err(CompileError::DuplicateName { .. })
    ));
    let one_bin = FeatureSpec::new("b", TransformKind::Bin, "a").with_params(FeatureParams {
        bins: Some(1),
        ..Default::default()
    });
    assert!(matches!(
        validate(&[one_bin]),
        Err(CompileError::InvalidParams { .. })
    ));
    assert!(matches!(
        validate(&[FeatureSpec::new("d", TransformKind::DatePart, "ts")]),
        Err(CompileError::InvalidParams { .. })
    ));
}

#[test]
fn disabled_features_emit_nothing_and_skip_validation() {
    let features = [
        FeatureSpec::new("keep", TransformKind::Square, "a"),
        FeatureSpec::new("incomplete", TransformKind::Ratio, "a").disabled(),
    ];
    let script = compile(&features).unwrap();
    assert!(script.source().contains("# [0] keep"));
    assert!(!script.source().contains("incomplete"));
}

#[test]
fn column_names_are_escaped() {
    let features = [FeatureSpec::new("q", TransformKind::Square, "say \"hi\"")];
    let script = compile(&features).unwrap();
    assert!(script.source().contains(r#"df["q"] = df["say \"hi\""] ** 2"#));
}

#[test]
fn compiles_from_json_payload() {
    let features: Vec<FeatureSpec> = serde_json::from_str(
        r#"[
            {"name": "gap", "transform": "difference", "column": "high", "secondaryColumn": "low"},
            {"name": "gap_mm", "transform": "min_max", "column": "gap"}
        ]"#,
    )
    .unwrap();
    let script = compile_with_schema(&features, ["high", "low"]).unwrap();
    assert!(script.source().starts_with("import numpy as np\nimport pandas as pd\n"));
    assert!(script.source().contains("df[\"gap\"] = df[\"high\"] - df[\"low\"]"));
}
