//! End-to-end coverage of the parser/evaluator/link pipeline against an
//! in-process upstream that records every decrypted message.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::mpsc,
    time::timeout,
};

use fleetbridge::{
    access::Capabilities,
    commands::{process_line, Bridge, SessionState},
    config::Config,
    directory::{InMemoryDirectory, SystemRecord},
    encryption,
    session::{run_session, SessionIo},
};

const KEYWORD: &str = "opensesame";
const OK_REPLY: &str =
    "<xml><header>answer</header><source>upstream</source><answer1>0</answer1></xml>";

/// Accepts connections, decrypts each line onto the channel and answers
/// every message with `reply`.
async fn spawn_upstream(
    iv: [u8; 16],
    reply: &'static str,
) -> Result<(SocketAddr, mpsc::UnboundedReceiver<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let plain = encryption::decrypt(&line, KEYWORD, &iv).unwrap_or_default();
                    let _ = tx.send(plain);
                    let envelope = encryption::encrypt(reply, KEYWORD, &iv);
                    if write_half
                        .write_all(format!("{envelope}\n").as_bytes())
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });

    Ok((addr, rx))
}

fn bridge_for(addr: SocketAddr) -> Bridge {
    let mut config = Config::default();
    config.modules.insert("jobs".into(), KEYWORD.into());

    let dir = InMemoryDirectory::empty();
    for (name, mac) in [
        ("m1", "aa:aa:aa:aa:aa:a1"),
        ("m2", "aa:aa:aa:aa:aa:a2"),
        ("dev3", "00:0c:29:aa:bb:03"),
    ] {
        dir.insert_system(SystemRecord {
            dn: format!("cn={name},ou=workstations,o=fleet"),
            name: name.into(),
            mac: mac.into(),
            ip: "127.0.0.1".into(),
            kind: "workstation".into(),
            ..Default::default()
        });
    }

    Bridge {
        config: Arc::new(config),
        directory: Arc::new(dir),
        target: addr.to_string(),
    }
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an upstream message")
        .expect("upstream recorder closed")
}

fn element(xml: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open).map(|idx| idx + open.len());
    match (start, xml.find(&close)) {
        (Some(start), Some(end)) if start <= end => xml[start..end].to_string(),
        _ => String::new(),
    }
}

fn noon() -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn implicit_list_carries_targets_across_job_commands() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = bridge_for(addr);
    let mut state = SessionState::new(Capabilities::legacy_defaults());

    let (_, _) = process_line(&bridge, &mut state, "examine m1 m2", noon()).await;
    let (_, _) = process_line(&bridge, &mut state, "localboot", noon()).await;
    let (_, _) = process_line(&bridge, &mut state, "wakeup", noon()).await;

    let expected = [
        ("job_trigger_action_localboot", "aa:aa:aa:aa:aa:a1"),
        ("job_trigger_action_localboot", "aa:aa:aa:aa:aa:a2"),
        ("job_trigger_action_wake", "aa:aa:aa:aa:aa:a1"),
        ("job_trigger_action_wake", "aa:aa:aa:aa:aa:a2"),
    ];
    for (header, mac) in expected {
        let message = next_message(&mut rx).await;
        assert_eq!(element(&message, "header"), header, "{message}");
        assert_eq!(element(&message, "macaddress"), mac, "{message}");
        assert_eq!(element(&message, "target"), mac, "{message}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn argument_order_produces_identical_messages() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = bridge_for(addr);

    let mut state = SessionState::new(Capabilities::legacy_defaults());
    let (_, _) = process_line(&bridge, &mut state, "install dev3 10:30", noon()).await;
    let time_first = next_message(&mut rx).await;

    let mut state = SessionState::new(Capabilities::legacy_defaults());
    let (_, _) = process_line(&bridge, &mut state, "install 10:30 dev3", noon()).await;
    let machine_first = next_message(&mut rx).await;

    assert_eq!(time_first, machine_first);
    assert_eq!(element(&time_first, "header"), "job_trigger_action_reinstall");
    assert_eq!(element(&time_first, "timestamp"), "20240501103000");
    assert_eq!(element(&time_first, "macaddress"), "00:0c:29:aa:bb:03");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn queries_carry_the_cnf_filter() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = bridge_for(addr);
    let mut state = SessionState::new(Capabilities::legacy_defaults());

    let (reply, _) = process_line(&bridge, &mut state, "query dev3", noon()).await;
    assert_eq!(reply, "OK");

    let message = next_message(&mut rx).await;
    assert_eq!(element(&message, "header"), "query_jobdb");
    assert_eq!(element(&message, "connector"), "or");
    assert_eq!(element(&message, "macaddress"), "00:0c:29:aa:bb:03");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_echoes_then_deletes_with_the_same_filter() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = bridge_for(addr);
    let mut state = SessionState::new(Capabilities::legacy_defaults());

    let (_, _) = process_line(&bridge, &mut state, "delete dev3", noon()).await;
    assert!(state.last_targets.is_empty());

    let first = next_message(&mut rx).await;
    let second = next_message(&mut rx).await;
    assert_eq!(element(&first, "header"), "query_jobdb");
    assert_eq!(element(&second, "header"), "delete_jobdb_entry");
    assert_eq!(element(&first, "where"), element(&second, "where"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn repeat_is_cancelled_by_new_input() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = Arc::new(bridge_for(addr));

    let (client, server) = tokio::io::duplex(65536);
    let (server_read, server_write) = tokio::io::split(server);
    let io = SessionIo::new(server_read, server_write, "test-session");
    let session = tokio::spawn(run_session(
        Arc::clone(&bridge),
        io,
        Capabilities::legacy_defaults(),
    ));

    let (mut client_read, mut client_write) = tokio::io::split(client);
    // drain whatever the session prints so its writes never block
    tokio::spawn(async move {
        let mut sink = vec![0u8; 4096];
        loop {
            use tokio::io::AsyncReadExt;
            if client_read.read(&mut sink).await.unwrap_or(0) == 0 {
                return;
            }
        }
    });

    client_write
        .write_all(b"qq dev3\nexamine dev3\n")
        .await?;

    let first = next_message(&mut rx).await;
    assert_eq!(element(&first, "header"), "query_jobdb");

    // the examine command arrived before the 5 s repeat fired, so no
    // second query may show up
    let extra = timeout(Duration::from_secs(6), rx.recv()).await;
    assert!(extra.is_err(), "repeat fired despite new input: {extra:?}");

    drop(client_write);
    timeout(Duration::from_secs(5), session).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_final_line_without_newline_still_runs_at_eof() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = Arc::new(bridge_for(addr));

    let (client, server) = tokio::io::duplex(65536);
    let (server_read, server_write) = tokio::io::split(server);
    let io = SessionIo::new(server_read, server_write, "test-session");
    let session = tokio::spawn(run_session(
        Arc::clone(&bridge),
        io,
        Capabilities::legacy_defaults(),
    ));

    let (mut client_read, mut client_write) = tokio::io::split(client);
    tokio::spawn(async move {
        let mut sink = vec![0u8; 4096];
        loop {
            use tokio::io::AsyncReadExt;
            if client_read.read(&mut sink).await.unwrap_or(0) == 0 {
                return;
            }
        }
    });

    client_write.write_all(b"query dev3").await?;
    drop(client_write);

    let message = next_message(&mut rx).await;
    assert_eq!(element(&message, "header"), "query_jobdb");
    timeout(Duration::from_secs(5), session).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn session_splits_semicolons_and_greets() -> Result<()> {
    let config = Config::default();
    let (addr, mut rx) = spawn_upstream(config.iv(), OK_REPLY).await?;
    let bridge = Arc::new(bridge_for(addr));

    let (client, server) = tokio::io::duplex(65536);
    let (server_read, server_write) = tokio::io::split(server);
    let io = SessionIo::new(server_read, server_write, "test-session");
    let session = tokio::spawn(run_session(
        Arc::clone(&bridge),
        io,
        Capabilities::legacy_defaults(),
    ));

    let (client_read, mut client_write) = tokio::io::split(client);
    client_write.write_all(b"query m1;query m2\n").await?;
    drop(client_write);

    let first = next_message(&mut rx).await;
    let second = next_message(&mut rx).await;
    assert_eq!(element(&first, "macaddress"), "aa:aa:aa:aa:aa:a1");
    assert_eq!(element(&second, "macaddress"), "aa:aa:aa:aa:aa:a2");

    let mut output = String::new();
    {
        use tokio::io::AsyncReadExt;
        let mut client_read = client_read;
        timeout(
            Duration::from_secs(5),
            client_read.read_to_string(&mut output),
        )
        .await??;
    }
    assert!(output.starts_with("# Enter \"help\""), "{output}");
    assert!(output.contains("OK"), "{output}");

    timeout(Duration::from_secs(5), session).await??;
    Ok(())
}
