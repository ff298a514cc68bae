//! Standalone VM provisioning (the detached `addproc`/`rmproc` path)
//! against a mock Azure management endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use azgrid_azure::{AzureClient, StaticToken};
use azgrid_core::Template;
use azgrid_detached::{addproc, rmproc, AddProcOptions};
use azgrid_scaleset::{ImageSpec, ScriptParams, SshKeys};
use serde_json::{json, Value};
use tokio::sync::watch;

#[derive(Clone, Default)]
struct MockAzure {
    nics: Arc<Mutex<HashMap<String, Value>>>,
    vms: Arc<Mutex<HashMap<String, Value>>>,
    deleted_nics: Arc<Mutex<Vec<String>>>,
    deleted_vms: Arc<Mutex<Vec<String>>>,
}

async fn put_nic(
    State(mock): State<MockAzure>,
    Path((sub, rg, name)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    mock.nics.lock().unwrap().insert(name.clone(), body);
    Json(json!({
        "id": format!("/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Network/networkInterfaces/{name}")
    }))
}

async fn get_nic(
    State(mock): State<MockAzure>,
    Path((_sub, _rg, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    if !mock.nics.lock().unwrap().contains_key(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({
        "name": name,
        "properties": {"ipConfigurations": [
            {"properties": {"privateIPAddress": "10.0.0.9"}}
        ]}
    })))
}

async fn delete_nic(
    State(mock): State<MockAzure>,
    Path((_sub, _rg, name)): Path<(String, String, String)>,
) -> StatusCode {
    mock.nics.lock().unwrap().remove(&name);
    mock.deleted_nics.lock().unwrap().push(name);
    StatusCode::OK
}

async fn put_vm(
    State(mock): State<MockAzure>,
    Path((_sub, _rg, name)): Path<(String, String, String)>,
    Json(mut body): Json<Value>,
) -> Json<Value> {
    body["name"] = json!(name);
    body["properties"]["provisioningState"] = json!("Succeeded");
    mock.vms.lock().unwrap().insert(name, body.clone());
    Json(body)
}

async fn get_vm(
    State(mock): State<MockAzure>,
    Path((_sub, _rg, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, StatusCode> {
    mock.vms
        .lock()
        .unwrap()
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_vm(
    State(mock): State<MockAzure>,
    Path((_sub, _rg, name)): Path<(String, String, String)>,
) -> StatusCode {
    mock.vms.lock().unwrap().remove(&name);
    mock.deleted_vms.lock().unwrap().push(name);
    StatusCode::OK
}

async fn list_vms(State(mock): State<MockAzure>) -> Json<Value> {
    let vms: Vec<Value> = mock.vms.lock().unwrap().values().cloned().collect();
    Json(json!({"value": vms}))
}

async fn skus() -> Json<Value> {
    Json(json!({"value": [{
        "name": "Standard_D2s_v3",
        "family": "standardDSv3Family",
        "capabilities": [{"name": "vCPUs", "value": "2"}]
    }]}))
}

async fn usages() -> Json<Value> {
    Json(json!({"value": [
        {"name": {"value": "standardDSv3Family"}, "currentValue": 0, "limit": 100},
        {"name": {"value": "lowPriorityCores"}, "currentValue": 0, "limit": 100}
    ]}))
}

async fn spawn_mock(mock: MockAzure) -> String {
    const NICS: &str = "/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Network/networkInterfaces";
    const VMS: &str = "/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachines";
    let router = Router::new()
        .route(
            &format!("{NICS}/{{name}}"),
            get(get_nic).put(put_nic).delete(delete_nic),
        )
        .route(
            &format!("{VMS}/{{name}}"),
            get(get_vm).put(put_vm).delete(delete_vm),
        )
        .route(VMS, get(list_vms))
        .route("/subscriptions/{sub}/providers/Microsoft.Compute/skus", get(skus))
        .route(
            "/subscriptions/{sub}/providers/Microsoft.Compute/locations/{loc}/usages",
            get(usages),
        )
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn vm_template() -> Template {
    Template {
        tempdisk: String::new(),
        value: json!({
            "location": "eastus",
            "properties": {
                "hardwareProfile": {"vmSize": "Standard_D2s_v3"},
                "osProfile": {
                    "adminUsername": "cluster",
                    "linuxConfiguration": {"ssh": {"publicKeys": []}}
                },
                "storageProfile": {"imageReference": {"id": "/subscriptions/s/galleries/g/images/base"}},
                "networkProfile": {}
            }
        }),
    }
}

fn nic_template() -> Template {
    Template {
        tempdisk: String::new(),
        value: json!({
            "location": "eastus",
            "properties": {"ipConfigurations": [{"name": "primary"}]}
        }),
    }
}

fn options() -> AddProcOptions {
    AddProcOptions {
        subscription: "sub".to_string(),
        resource_group: "rg".to_string(),
        basename: "cbox".to_string(),
        detached_service: false,
        image: ImageSpec::default(),
        ssh: SshKeys {
            user: "cluster".to_string(),
            public_key: "ssh-rsa AAAA".to_string(),
        },
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn addproc_provisions_nic_then_vm() {
    let mock = MockAzure::default();
    let endpoint = spawn_mock(mock.clone()).await;
    let client = AzureClient::new(Arc::new(StaticToken::new("t")))
        .with_endpoint(endpoint)
        .with_nretry(2);
    let (_interrupt_tx, mut interrupt) = watch::channel(false);

    let mut params = ScriptParams {
        user: "cluster".to_string(),
        master_home: std::path::PathBuf::from("/nonexistent"),
        ..Default::default()
    };
    let identity = addproc(
        &client,
        &vm_template(),
        &nic_template(),
        &mut params,
        &options(),
        &mut interrupt,
    )
    .await
    .unwrap();

    assert!(identity.name.starts_with("cbox-"));
    assert_eq!(identity.ip, "10.0.0.9");
    assert_eq!(identity.subscriptionid, "sub");

    let vms = mock.vms.lock().unwrap();
    let body = &vms[&identity.name];
    // NIC id injected, SSH key appended, startup script attached.
    let nic_id = body["properties"]["networkProfile"]["networkInterfaces"][0]["id"]
        .as_str()
        .unwrap();
    assert!(nic_id.ends_with(&format!("{}-nic", identity.name)));
    assert_eq!(
        body["properties"]["osProfile"]["linuxConfiguration"]["ssh"]["publicKeys"][0]["keyData"],
        "ssh-rsa AAAA"
    );
    assert!(body["properties"]["osProfile"]["customData"].is_string());
    assert_eq!(body["properties"]["osProfile"]["computerName"], identity.name.as_str());
}

#[tokio::test]
async fn rmproc_removes_vm_then_nic() {
    let mock = MockAzure::default();
    let endpoint = spawn_mock(mock.clone()).await;
    let client = AzureClient::new(Arc::new(StaticToken::new("t")))
        .with_endpoint(endpoint)
        .with_nretry(2);
    let (_interrupt_tx, mut interrupt) = watch::channel(false);

    let mut params = ScriptParams {
        user: "cluster".to_string(),
        master_home: std::path::PathBuf::from("/nonexistent"),
        ..Default::default()
    };
    let identity = addproc(
        &client,
        &vm_template(),
        &nic_template(),
        &mut params,
        &options(),
        &mut interrupt,
    )
    .await
    .unwrap();

    rmproc(&client, &identity, Duration::from_secs(5)).await.unwrap();

    assert_eq!(*mock.deleted_vms.lock().unwrap(), vec![identity.name.clone()]);
    assert_eq!(
        *mock.deleted_nics.lock().unwrap(),
        vec![format!("{}-nic", identity.name)]
    );
    assert!(mock.vms.lock().unwrap().is_empty());
}
