//! End-to-end campaigns against loopback servers.
use std::collections::HashSet;
use std::net::IpAddr;

use cdnscan::cache::{FailureStore, FileFailureStore};
use cdnscan::campaign::{
    Campaign, CampaignEvent, CampaignOptions, CampaignStatus, ScanMethod, StopReason, TargetCount,
};
use cdnscan::input::SpeedProfile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const TRACE_BODY: &str = "fl=1\nh=www.cloudflare.com\nip=127.0.0.1\ncolo=LOC\n";

/// A keep-alive HTTP server answering every request with a trace body.
async fn trace_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut socket = BufReader::new(socket);
                let mut line = String::new();
                loop {
                    line.clear();
                    match socket.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) if line == "\r\n" => {
                            let reply = format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{TRACE_BODY}",
                                TRACE_BODY.len()
                            );
                            if socket.write_all(reply.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn options(ports: Vec<u16>, target: TargetCount) -> CampaignOptions {
    CampaignOptions {
        ranges: vec!["127.0.0.1".to_owned()],
        ports,
        profile: SpeedProfile::Hyper,
        target,
        ping_min: 0,
        ping_max: 2000,
        method: ScanMethod::Trace,
        shuffle: true,
        workers: Some(8),
    }
}

#[tokio::test]
async fn finds_a_local_edge() {
    let primary = trace_server().await;
    let secondary = trace_server().await;
    let closed = closed_port().await;

    let mut campaign = Campaign::new(
        options(vec![primary, closed, secondary], TargetCount::Bounded(1)),
        CancellationToken::new(),
    );
    let mut events = Vec::new();
    let summary = campaign.run(|e| events.push(e)).await.unwrap();

    assert_eq!(summary.reason, StopReason::TargetReached);
    assert_eq!(summary.total_found, 1);
    assert_eq!(campaign.state().status, CampaignStatus::Completed);

    let found: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CampaignEvent::Result(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address, "127.0.0.1".parse::<IpAddr>().unwrap());
    assert_eq!(found[0].open_ports, vec![primary, secondary]);
    assert!(found[0].score > 0.0);
}

#[tokio::test]
async fn unreachable_edge_is_remembered() {
    let port = closed_port().await;
    let path = std::env::temp_dir().join(format!("cdnscan-flow-{}.txt", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let mut campaign = Campaign::new(
        options(vec![port], TargetCount::Bounded(3)),
        CancellationToken::new(),
    )
    .with_failure_store(Box::new(FileFailureStore::new(&path)));
    let summary = campaign.run(|_| {}).await.unwrap();

    assert_eq!(summary.reason, StopReason::RangesExhausted);
    assert_eq!(summary.total_found, 0);
    assert_eq!(summary.total_scanned, 1);

    let saved: HashSet<IpAddr> = FileFailureStore::new(&path).load().unwrap();
    std::fs::remove_file(&path).unwrap();
    assert!(saved.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
}

#[tokio::test]
async fn events_serialize_as_json_lines() {
    let port = trace_server().await;
    let mut campaign = Campaign::new(
        options(vec![port], TargetCount::Unbounded),
        CancellationToken::new(),
    );
    let mut lines = Vec::new();
    campaign
        .run(|e| lines.push(serde_json::to_value(&e).unwrap()))
        .await
        .unwrap();

    let kinds: Vec<&str> = lines.iter().filter_map(|l| l["event"].as_str()).collect();
    assert!(kinds.contains(&"progress"));
    assert!(kinds.contains(&"result"));
    assert_eq!(kinds.last(), Some(&"summary"));

    let summary = lines.last().unwrap();
    assert_eq!(summary["reason"], "single_round");
    assert_eq!(summary["status"], "completed");
    let result = lines.iter().find(|l| l["event"] == "result").unwrap();
    assert_eq!(result["address"], "127.0.0.1");
    assert!(result.get("config").is_none());
}
