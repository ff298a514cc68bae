//! End-to-end detached-job flow, client against a live in-process
//! service with `sh` standing in for the worker runtime.

use std::sync::Arc;
use std::time::Duration;

use azgrid_core::DetachedVm;
use azgrid_detached::{
    build_router, DetachedClient, DetachedError, ExeConfig, JobRegistry, OutputStream, ServerState,
};
use tokio::sync::mpsc;

struct TestService {
    client: DetachedClient,
    vm: DetachedVm,
    terminate_rx: mpsc::Receiver<()>,
    _workdir: tempfile::TempDir,
}

async fn spawn_service() -> TestService {
    let workdir = tempfile::tempdir().unwrap();
    let registry = Arc::new(JobRegistry::new(
        workdir.path().to_path_buf(),
        ExeConfig {
            exename: "sh".to_string(),
            exeflags: Vec::new(),
        },
    ));
    let vm = DetachedVm {
        name: "cbox-test".to_string(),
        ip: "127.0.0.1".to_string(),
        subscriptionid: "sub".to_string(),
        resourcegroup: "rg".to_string(),
    };
    let (terminate_tx, terminate_rx) = mpsc::channel(1);
    let state = ServerState {
        registry,
        vm: vm.clone(),
        terminate: terminate_tx,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestService {
        client: DetachedClient::new().with_port(port),
        vm,
        terminate_rx,
        _workdir: workdir,
    }
}

#[tokio::test]
async fn ping_and_identity() {
    let service = spawn_service().await;
    assert!(service.client.ping("127.0.0.1").await);

    let identity = service.client.vm_identity("127.0.0.1").await.unwrap();
    assert_eq!(identity.name, "cbox-test");
    assert_eq!(identity.subscriptionid, "sub");
}

#[tokio::test]
async fn persistent_job_round_trip() {
    let service = spawn_service().await;
    let job = service
        .client
        .run(
            &service.vm,
            "printf 'job1-out'; printf 'job1-err' >&2",
            true,
            None,
        )
        .await
        .unwrap();

    service.client.wait(&job).await.unwrap();
    assert_eq!(service.client.status(&job).await.unwrap(), "done");
    assert_eq!(
        service.client.read(&job, OutputStream::Stdout).await.unwrap(),
        "job1-out"
    );
    assert_eq!(
        service.client.read(&job, OutputStream::Stderr).await.unwrap(),
        "job1-err"
    );
}

#[tokio::test]
async fn second_job_on_recovered_identity() {
    // A client holding only the IP recovers the identity over /vm and
    // submits against the same server.
    let service = spawn_service().await;
    let job1 = service
        .client
        .run(&service.vm, "printf 'job1-out'", true, None)
        .await
        .unwrap();
    service.client.wait(&job1).await.unwrap();

    let identity = service.client.vm_identity("127.0.0.1").await.unwrap();
    let job2 = service
        .client
        .run(&identity, "printf 'job2-out'; printf 'job2-err' >&2", true, None)
        .await
        .unwrap();
    service.client.wait(&job2).await.unwrap();

    assert_ne!(job1.id, job2.id);
    assert_eq!(
        service.client.read(&job2, OutputStream::Stdout).await.unwrap(),
        "job2-out"
    );
    assert_eq!(
        service.client.read(&job2, OutputStream::Stderr).await.unwrap(),
        "job2-err"
    );
}

#[tokio::test]
async fn failed_job_reports_error_and_listing() {
    let service = spawn_service().await;
    let job = service
        .client
        .run(&service.vm, "echo broken >&2\nexit 7", true, None)
        .await
        .unwrap();

    let err = service.client.wait(&job).await.unwrap_err();
    match err {
        DetachedError::Service { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("error"));
            assert!(body.contains("exit 7"), "listing missing from {body}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(service.client.status(&job).await.unwrap(), "failed");
}

#[tokio::test]
async fn begin_end_wrapper_executes_inner_code() {
    let service = spawn_service().await;
    let job = service
        .client
        .run(&service.vm, "begin\nprintf 'inner'\nend", true, None)
        .await
        .unwrap();
    service.client.wait(&job).await.unwrap();
    assert_eq!(
        service.client.read(&job, OutputStream::Stdout).await.unwrap(),
        "inner"
    );
}

#[tokio::test]
async fn unknown_job_id_is_not_found() {
    let service = spawn_service().await;
    let bogus = azgrid_detached::DetachedJobHandle {
        vm: service.vm.clone(),
        id: "999".to_string(),
        log_url: String::new(),
    };
    let err = service.client.status(&bogus).await.unwrap_err();
    match err {
        DetachedError::Service { status, .. } => assert_eq!(status, 404),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_code_is_a_client_error() {
    let service = spawn_service().await;
    let err = service.client.run(&service.vm, "", true, None).await.unwrap_err();
    match err {
        DetachedError::Service { status, .. } => assert_eq!(status, 400),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn non_persistent_job_requests_vm_deletion() {
    let mut service = spawn_service().await;
    let job = service
        .client
        .run(&service.vm, "true", false, None)
        .await
        .unwrap();
    service.client.wait(&job).await.unwrap();

    // The server asks its host to delete the VM once the job is done.
    let request = tokio::time::timeout(Duration::from_secs(5), service.terminate_rx.recv())
        .await
        .expect("no termination request within 5s");
    assert!(request.is_some());
}

#[tokio::test]
async fn variable_bundle_is_accepted() {
    let service = spawn_service().await;
    let bundle = serde_json::json!({"threshold": 42});
    let job = service
        .client
        .run(&service.vm, "true", true, Some(&bundle))
        .await
        .unwrap();
    service.client.wait(&job).await.unwrap();
    assert_eq!(service.client.status(&job).await.unwrap(), "done");
}
