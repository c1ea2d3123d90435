mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use common::{engine, fast_options, scope};
use stratus::executor::engine::{OutcomeStatus, ResourceAction};
use stratus::{parse_template, project_outputs, resolve_values, EngineError, OutputValue};

const NEXTCLOUD: &str = r#"{
    "parameters": {
        "prefix": {"type": "string", "minLength": 3, "maxLength": 8},
        "useAcr": {"type": "bool", "defaultValue": false},
        "dbPassword": {"type": "secureString", "defaultValue": "changeme"}
    },
    "variables": {
        "registryName": "${concat(parameters.prefix, uniqueString('registry'))}"
    },
    "resources": [
        {
            "name": "net",
            "type": "network/virtualNetworks",
            "apiVersion": "2023-05-01",
            "properties": {"addressSpace": "10.10.0.0/16"}
        },
        {
            "name": "pg",
            "type": "database/flexibleServers",
            "apiVersion": "2023-06-01",
            "dependsOn": ["net"],
            "properties": {"administratorPassword": "${parameters.dbPassword}"}
        },
        {
            "name": "acr",
            "type": "registry/registries",
            "apiVersion": "2023-07-01",
            "slot": "registry",
            "condition": "${parameters.useAcr}",
            "properties": {"name": "${variables.registryName}", "sku": "Basic"}
        },
        {
            "name": "dockerHub",
            "type": "registry/publicHub",
            "apiVersion": "2023-07-01",
            "slot": "registry",
            "condition": "${!parameters.useAcr}",
            "existing": true,
            "properties": {}
        },
        {
            "name": "nextcloud",
            "type": "app/containerApps",
            "apiVersion": "2023-08-01",
            "slot": "app",
            "properties": {
                "image": "${slot.registry.loginServer}/nextcloud:29",
                "dbHost": "${pg.fqdn}"
            }
        }
    ],
    "outputs": {
        "nextcloudDefaultFqdn": {"value": "${slot.app.ingressFqdn}"},
        "registryLogin": {"value": "${slot.registry.loginServer}"}
    }
}"#;

fn bind(supplied: &[(&str, serde_json::Value)]) -> (stratus::template::types::Template, stratus::ResolvedValues) {
    let template = parse_template(NEXTCLOUD).unwrap();
    let mut params = BTreeMap::new();
    for (k, v) in supplied {
        params.insert(k.to_string(), v.clone());
    }
    let values = resolve_values(&template, &params, scope()).unwrap();
    (template, values)
}

#[tokio::test]
async fn test_acr_variant_selected_when_flag_set() {
    let (engine, provider, _store) = engine();
    let (template, values) = bind(&[
        ("prefix", serde_json::json!("nc50m")),
        ("useAcr", serde_json::json!(true)),
    ]);

    let report = engine
        .apply(&template, &values, "dep-1", fast_options())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.slot_aliases["registry"], "acr");
    assert!(matches!(
        report.outcome("acr").unwrap().status,
        OutcomeStatus::Succeeded { action: ResourceAction::Create }
    ));
    assert_eq!(
        report.outcome("dockerHub").unwrap().status,
        OutcomeStatus::SkippedDisabled
    );

    // The app pulled its image reference through the selected variant.
    let image = provider.applied_props.get("nextcloud").unwrap()["image"].clone();
    assert_eq!(image, serde_json::json!("acr.registry.example.io/nextcloud:29"));

    let outputs = project_outputs(&template, &values, &report).unwrap();
    assert_eq!(
        outputs["nextcloudDefaultFqdn"],
        OutputValue::Resolved(serde_json::json!("nextcloud.apps.example"))
    );
    assert_eq!(
        outputs["registryLogin"],
        OutputValue::Resolved(serde_json::json!("acr.registry.example.io"))
    );
}

#[tokio::test]
async fn test_external_variant_selected_when_flag_unset() {
    let (engine, provider, _store) = engine();
    provider.add_external(
        "dockerHub",
        serde_json::json!({"loginServer": "registry-1.docker.io"}),
    );
    let (template, values) = bind(&[("prefix", serde_json::json!("nc50m"))]);

    let report = engine
        .apply(&template, &values, "dep-1", fast_options())
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(report.slot_aliases["registry"], "dockerHub");
    assert_eq!(
        report.outcome("acr").unwrap().status,
        OutcomeStatus::SkippedDisabled
    );
    // The external registry was read, never created.
    assert!(matches!(
        report.outcome("dockerHub").unwrap().status,
        OutcomeStatus::Succeeded { action: ResourceAction::Read }
    ));
    assert!(!provider.applied_props.contains_key("dockerHub"));

    let image = provider.applied_props.get("nextcloud").unwrap()["image"].clone();
    assert_eq!(image, serde_json::json!("registry-1.docker.io/nextcloud:29"));
}

#[tokio::test]
async fn test_reapply_converges_to_same_derived_names() {
    let (engine, provider, _store) = engine();
    let (template, values) = bind(&[
        ("prefix", serde_json::json!("nc50m")),
        ("useAcr", serde_json::json!(true)),
    ]);

    engine
        .apply(&template, &values, "dep-1", fast_options())
        .await
        .unwrap();
    let first_name = provider.applied_props.get("acr").unwrap()["name"].clone();
    let mutations = provider.total_mutations();

    let report = engine
        .apply(&template, &values, "dep-1", fast_options())
        .await
        .unwrap();

    // Derived names are re-derived, not remembered, so nothing drifts.
    assert_eq!(report.created + report.updated, 0);
    assert_eq!(provider.total_mutations(), mutations);
    assert_eq!(
        provider.applied_props.get("acr").unwrap()["name"],
        first_name
    );
}

#[tokio::test]
async fn test_overlapping_variant_conditions_fail_preflight() {
    let (engine, provider, _store) = engine();
    let template = parse_template(
        r#"{
            "parameters": {"flag": {"type": "bool", "defaultValue": true}},
            "resources": [
                {"name": "a", "type": "t/a", "apiVersion": "1", "slot": "s",
                 "condition": "${parameters.flag}", "properties": {}},
                {"name": "b", "type": "t/b", "apiVersion": "1", "slot": "s",
                 "condition": "${parameters.flag}", "properties": {}}
            ]
        }"#,
    )
    .unwrap();
    let values = resolve_values(&template, &BTreeMap::new(), scope()).unwrap();

    let err = engine
        .apply(&template, &values, "dep-1", fast_options())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::VariantSelection { ref slot, active: 2 } if slot == "s"
    ));
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn test_disabled_resource_cascades_to_sole_dependents() {
    let (engine, _provider, _store) = engine();
    let template = parse_template(
        r#"{
            "parameters": {"wantCdn": {"type": "bool", "defaultValue": false}},
            "resources": [
                {"name": "cdn", "type": "cdn/profiles", "apiVersion": "1",
                 "condition": "${parameters.wantCdn}", "properties": {}},
                {"name": "cdnRoute", "type": "cdn/routes", "apiVersion": "1",
                 "dependsOn": ["cdn"], "properties": {}},
                {"name": "site", "type": "web/sites", "apiVersion": "1", "properties": {}}
            ]
        }"#,
    )
    .unwrap();
    let values = resolve_values(&template, &BTreeMap::new(), scope()).unwrap();

    let report = engine
        .apply(&template, &values, "dep-1", fast_options())
        .await
        .unwrap();

    assert_eq!(
        report.outcome("cdn").unwrap().status,
        OutcomeStatus::SkippedDisabled
    );
    // Nothing for the route to attach to, so it is pruned as well.
    assert_eq!(
        report.outcome("cdnRoute").unwrap().status,
        OutcomeStatus::SkippedDisabled
    );
    assert!(matches!(
        report.outcome("site").unwrap().status,
        OutcomeStatus::Succeeded { action: ResourceAction::Create }
    ));
}
