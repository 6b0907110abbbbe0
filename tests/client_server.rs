//! Protocol client behavior against a scripted CAM server.

mod common;

use std::time::Duration;

use camlink::protocol::{CamCommand, ImagingJob};
use camlink::{CamClient, CamError, JobFilter};
use common::{MockCamServer, NAME_J7};

const WAIT: Duration = Duration::from_secs(2);

async fn connected_client(server: &MockCamServer) -> CamClient {
    let mut client = CamClient::new(server.addr.ip().to_string(), server.addr.port(), 0);
    client.connect().await.expect("connect to mock server");
    client
}

#[tokio::test]
async fn delivers_notification_for_the_job_of_interest() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    server.push_image(NAME_J7);
    let (filename, metadata) = client.wait_for_image(7, WAIT).await.unwrap();
    assert_eq!(filename, NAME_J7);
    assert_eq!(metadata.job.value(), 7);
    assert_eq!(metadata.chamber_u.value(), 4);
}

#[tokio::test]
async fn skips_notifications_for_other_jobs() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    server.push_image(&NAME_J7.replace("--J07", "--J02"));
    server.push_image(NAME_J7);
    let (filename, _) = client.wait_for_image(7, WAIT).await.unwrap();
    assert_eq!(filename, NAME_J7);
}

#[tokio::test]
async fn duplicate_filename_is_delivered_exactly_once() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    let second = NAME_J7.replace("--T0003", "--T0004");
    server.push_image(NAME_J7);
    server.push_image(NAME_J7); // server double-send
    server.push_image(&second);

    let (first_seen, _) = client.wait_for_image(7, WAIT).await.unwrap();
    assert_eq!(first_seen, NAME_J7);
    // The repeat is absorbed; the next delivery is the next distinct file.
    let (next_seen, _) = client.wait_for_image(7, WAIT).await.unwrap();
    assert_eq!(next_seen, second);
}

#[tokio::test]
async fn duplicate_does_not_produce_a_second_result_before_timeout() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    server.push_image(NAME_J7);
    client.wait_for_image(7, WAIT).await.unwrap();

    server.push_image(NAME_J7);
    match client.wait_for_image(7, Duration::from_millis(300)).await {
        Err(CamError::Timeout(_)) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn first_notification_fixes_the_job_of_interest() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;
    assert_eq!(client.job_filter(), JobFilter::Unknown);

    server.push_image(NAME_J7);
    let (_, metadata) = client.wait_for_image(-1, WAIT).await.unwrap();
    assert_eq!(metadata.job.value(), 7);
    assert_eq!(client.job_filter(), JobFilter::Fixed(7));

    // From now on only job 7 is accepted, without anyone setting it.
    let foreign = NAME_J7.replace("--J07", "--J05").replace("--T0003", "--T0004");
    let wanted = NAME_J7.replace("--T0003", "--T0005");
    server.push_image(&foreign);
    server.push_image(&wanted);
    let (filename, _) = client.wait_for_image(-1, WAIT).await.unwrap();
    assert_eq!(filename, wanted);
}

#[tokio::test]
async fn times_out_when_nothing_matches() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    match client.wait_for_image(7, Duration::from_millis(200)).await {
        Err(CamError::Timeout(t)) => assert_eq!(t, Duration::from_millis(200)),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_filename_aborts_the_wait() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    // Keyed chatter without a path is skipped; a path outside the grammar
    // is fatal.
    server.push("/app:matrix /cmd:startscan /status:ok");
    server.push_image("scan_0001.tif");
    match client.wait_for_image(7, WAIT).await {
        Err(CamError::MalformedFilename(name)) => assert_eq!(name, "scan_0001.tif"),
        other => panic!("expected MalformedFilename, got {other:?}"),
    }
}

#[tokio::test]
async fn flush_discards_stale_notifications() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    server.push_image(&NAME_J7.replace("--T0003", "--T0001"));
    server.push_image(&NAME_J7.replace("--T0003", "--T0002"));
    let drained = client.flush_pending().await.unwrap();
    assert_eq!(drained, 2);

    // The flushed lines are gone; only the fresh one is delivered.
    server.push_image(NAME_J7);
    let (filename, _) = client.wait_for_image(7, WAIT).await.unwrap();
    assert_eq!(filename, NAME_J7);
}

#[tokio::test]
async fn commands_reach_the_server_verbatim() {
    let mut server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    let job = ImagingJob {
        job_name: "Hiresjob".into(),
        dx: -3,
        dy: 12,
        slide: 1,
        well_x: 5,
        well_y: 7,
        field_x: 1,
        field_y: 2,
    };
    client.send_command(&CamCommand::DeleteList).await.unwrap();
    client
        .send_command(&CamCommand::AddJob(job.clone()))
        .await
        .unwrap();
    client.send_command(&CamCommand::StartScan).await.unwrap();
    client.send_command(&CamCommand::StopWaiting).await.unwrap();

    assert_eq!(server.expect_line().await, CamCommand::DeleteList.encode(0));
    assert_eq!(server.expect_line().await, CamCommand::AddJob(job).encode(0));
    assert_eq!(server.expect_line().await, CamCommand::StartScan.encode(0));
    assert_eq!(server.expect_line().await, CamCommand::StopWaiting.encode(0));
    server.expect_silence().await;
}

#[tokio::test]
async fn is_connected_reflects_local_state_not_liveness() {
    let server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;
    assert!(client.is_connected());

    // Kill the server; the client has no way to know yet.
    drop(server);
    assert!(client.is_connected());

    // The next read notices and the client marks itself disconnected.
    match client.wait_for_image(7, WAIT).await {
        Err(CamError::Connection(_)) => {}
        other => panic!("expected connection error, got {other:?}"),
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn reconnect_replaces_the_previous_socket() {
    let mut server = MockCamServer::spawn().await;
    let mut client = connected_client(&server).await;

    client.connect().await.unwrap();
    assert!(client.is_connected());
    client.send_command(&CamCommand::StartScan).await.unwrap();
    assert_eq!(server.expect_line().await, CamCommand::StartScan.encode(0));
}

#[tokio::test]
async fn connecting_to_a_dead_port_is_a_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut client = CamClient::new("127.0.0.1", port, 0);
    assert!(matches!(
        client.connect().await,
        Err(CamError::Connection(_))
    ));
    assert!(!client.is_connected());
}
