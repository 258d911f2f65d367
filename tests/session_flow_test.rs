//! End-to-end command protocol runs against a director with a fake daemon.

mod common;

use common::{eventually, start_director, LineClient};
use ptd_director::bundle;
use ptd_director::client::DirectorClient;
use ptd_director::session::SessionManifest;
use ptd_director::transfer;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_full_session_produces_phase_dirs() {
    let director = start_director().await;
    let mut client = LineClient::connect(director.addr).await;

    assert!(client.cmd("hello").await.starts_with("OK ptd-director/"));
    let time = client.cmd("time").await;
    let secs: f64 = time.strip_prefix("OK ").unwrap().parse().unwrap();
    assert!(secs > 1.6e9);

    let id = client.new_session("e2e").await;
    assert!(id.ends_with("_e2e"));
    for command in [
        "start,ranging",
        "stop,ranging",
        "start,testing",
        "stop,testing",
        "done",
    ] {
        assert_eq!(
            client.cmd(&format!("session,{},{}", id, command)).await,
            "OK",
            "{}",
            command
        );
    }

    for phase in ["ranging", "testing"] {
        let spl = director.out_dir.join(format!("{}_{}", id, phase)).join("spl.txt");
        let text = fs::read_to_string(&spl).unwrap();
        assert_eq!(text.lines().count(), 3, "{}", phase);
        assert!(text.lines().all(|l| l.ends_with(&format!("Mark,{}_{}", id, phase))));
    }

    let commands = director.ptd.commands();
    assert!(commands.contains(&"SR,V,253".to_string()));
    assert!(commands.contains(&"SR,A,5.5".to_string()));
    assert!(commands.contains(&format!("Go,1000,0,{}_testing", id)));

    let manifest =
        SessionManifest::load(&director.out_dir.join(format!("{}_session.json", id))).unwrap();
    assert_eq!(manifest.phases.len(), 2);
    assert!(!manifest.aborted);
    assert_eq!(manifest.calibration.unwrap().max_volts, 230.0);
    assert!(!director.instrument.is_leased());
}

#[tokio::test]
async fn test_download_and_cleanup_of_finished_session() {
    let director = start_director().await;
    let mut client = DirectorClient::connect(&director.addr.to_string())
        .await
        .unwrap();
    client.hello().await.unwrap();
    let id = client.new_session("dl", None).await.unwrap();
    client
        .start(&id, ptd_director::session::Phase::Ranging, None)
        .await
        .unwrap();
    client
        .stop(&id, ptd_director::session::Phase::Ranging)
        .await
        .unwrap();
    client.done(&id).await.unwrap();

    let local = TempDir::new().unwrap();
    let dest = local.path().join("spl.txt");
    let bytes = client.download(&id, "ranging/spl.txt", &dest).await.unwrap();
    let server_copy = director.out_dir.join(format!("{}_ranging", id)).join("spl.txt");
    assert_eq!(bytes, fs::metadata(&server_copy).unwrap().len());
    assert_eq!(fs::read(&dest).unwrap(), fs::read(&server_copy).unwrap());

    assert!(client
        .download(&id, "../ptd_logfile.log", &local.path().join("x"))
        .await
        .is_err());
    // the refusal did not break framing
    client.server_time().await.unwrap();

    client.cleanup(&id).await.unwrap();
    assert!(!server_copy.exists());
    assert!(!director.out_dir.join(format!("{}_session.json", id)).exists());
    assert!(client.cleanup(&id).await.is_err());
}

#[tokio::test]
async fn test_out_of_order_commands_are_rejected() {
    let director = start_director().await;
    let mut client = LineClient::connect(director.addr).await;
    let id = client.new_session("order").await;
    let session = |command: &str| format!("session,{},{}", id, command);

    assert!(client.cmd(&session("stop,ranging")).await.starts_with("ERR "));
    assert!(client.cmd(&session("start,testing")).await.starts_with("ERR "));
    assert!(client.cmd(&session("done")).await.starts_with("ERR "));

    assert_eq!(client.cmd(&session("start,ranging")).await, "OK");
    assert!(client.cmd(&session("start,ranging")).await.starts_with("ERR "));
    assert!(client.cmd(&session("start,testing,auto")).await.starts_with("ERR "));
    assert!(client.cmd(&session("stop,testing")).await.starts_with("ERR "));
    assert!(client.cmd(&session("done")).await.starts_with("ERR "));

    // still running ranging, so the legal next step works
    assert_eq!(client.cmd(&session("stop,ranging")).await, "OK");
    assert!(client.cmd(&session("stop,ranging")).await.starts_with("ERR "));
    assert_eq!(client.cmd(&session("start,testing")).await, "OK");
}

#[tokio::test]
async fn test_malformed_requests_keep_the_connection() {
    let director = start_director().await;
    let mut client = LineClient::connect(director.addr).await;

    assert!(client.cmd("bogus").await.starts_with("ERR "));
    assert!(client.cmd("new").await.starts_with("ERR "));
    assert!(client.cmd("new,bad label").await.starts_with("ERR "));
    assert!(client.cmd("session,nope,done").await.starts_with("ERR "));
    assert!(client.cmd("hello,extra").await.starts_with("ERR "));

    let id = client.new_session("ok").await;
    assert!(client.cmd("new,again").await.starts_with("ERR "));
    assert!(client
        .cmd(&format!("session,{},start,ranging,auto", id))
        .await
        .starts_with("ERR "));
    assert!(client
        .cmd("session,other-id,start,ranging")
        .await
        .starts_with("ERR "));
    assert!(client.cmd("hello").await.starts_with("OK "));
}

#[tokio::test]
async fn test_second_connection_cannot_start_a_session() {
    let director = start_director().await;
    let mut first = LineClient::connect(director.addr).await;
    let mut second = LineClient::connect(director.addr).await;

    first.new_session("a").await;
    assert!(second.cmd("new,b").await.starts_with("ERR "));

    drop(first);
    let instrument = director.instrument.clone();
    assert!(eventually(Duration::from_secs(3), || !instrument.is_leased()).await);
    assert!(second.cmd("new,b").await.starts_with("OK "));
}

#[tokio::test]
async fn test_upload_in_wrong_state_is_drained() {
    let director = start_director().await;
    let mut client = LineClient::connect(director.addr).await;
    let id = client.new_session("up").await;

    client.send(&format!("session,{},upload,ranging", id)).await;
    client.send_blob(&[7u8; 5000]).await;
    assert!(client.recv().await.starts_with("ERR "));
    assert!(client.cmd("hello").await.starts_with("OK "));

    client.send("session,wrong,upload,ranging").await;
    client.send_blob(b"ignored").await;
    assert!(client.recv().await.starts_with("ERR "));
    assert!(client.cmd("hello").await.starts_with("OK "));
}

#[tokio::test]
async fn test_upload_is_stored_and_unpacked() {
    let director = start_director().await;
    let mut client = LineClient::connect(director.addr).await;
    let id = client.new_session("up").await;
    assert_eq!(client.cmd(&format!("session,{},start,ranging", id)).await, "OK");
    assert_eq!(client.cmd(&format!("session,{},stop,ranging", id)).await, "OK");

    let local = TempDir::new().unwrap();
    let logs = local.path().join("loadgen");
    fs::create_dir_all(logs.join("sub")).unwrap();
    fs::write(logs.join("summary.txt"), "score 42").unwrap();
    fs::write(logs.join("sub").join("detail.txt"), "details").unwrap();
    let archive = local.path().join("ranging_logs.zip");
    assert_eq!(bundle::zip_dir(&logs, &archive).unwrap(), 2);

    client.send(&format!("session,{},upload,ranging", id)).await;
    transfer::send_file(&mut client.writer, &archive).await.unwrap();
    assert_eq!(client.recv().await, "OK");

    let phase_dir = director.out_dir.join(format!("{}_ranging", id));
    assert!(phase_dir.join("ranging_logs.zip").exists());
    assert!(!phase_dir.join("ranging_logs.zip.part").exists());
    assert_eq!(
        fs::read_to_string(phase_dir.join("loadgen/sub/detail.txt")).unwrap(),
        "details"
    );

    assert_eq!(client.cmd(&format!("session,{},done", id)).await, "OK");
    let manifest =
        SessionManifest::load(&director.out_dir.join(format!("{}_session.json", id))).unwrap();
    assert!(manifest.phases[0].upload.is_some());
}
