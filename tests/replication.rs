//! Leader/follower replication over the replication listener: snapshot
//! bootstrap, live tailing, caught-up detection, and follower resets.

mod common;

use common::{cmd, dump, must, render};
use meridian::{Error, Server};
use std::time::{Duration, Instant};

/// Copy the leader's snapshot directory into the follower's data dir, the
/// way the out-of-band pull helper would.
fn hand_snapshot_over(leader_dir: &std::path::Path, follower_dir: &std::path::Path, id: &str) {
    let src = leader_dir.join("snapshots").join(id);
    let dst = follower_dir.join("snapshots").join(id);
    std::fs::create_dir_all(&dst).unwrap();
    for entry in std::fs::read_dir(&src).unwrap() {
        let entry = entry.unwrap();
        let sub_dst = dst.join(entry.file_name());
        std::fs::create_dir_all(&sub_dst).unwrap();
        for file in std::fs::read_dir(entry.path()).unwrap() {
            let file = file.unwrap();
            std::fs::copy(file.path(), sub_dst.join(file.file_name())).unwrap();
        }
    }
}

/// Poll the follower until its reads stop failing with "catching up" and it
/// reports caught_up.
fn wait_caught_up(follower: &std::sync::Arc<Server>) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(reply) = cmd(follower, &["SERVER"]) {
            let text = render(&reply);
            if text.contains("caught_up true") {
                return;
            }
        }
        assert!(Instant::now() < deadline, "follower never caught up");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_snapshot_bootstrap_and_live_tail() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let leader = Server::open(leader_dir.path()).unwrap();
    let (addr, _handle) = leader.serve_replication("127.0.0.1:0").unwrap();

    for i in 0..1000 {
        let id = format!("t{}", i);
        let lat = format!("{}", (i % 90) as f64 / 2.0);
        let lon = format!("{}", (i % 180) as f64 / 2.0);
        must(&leader, &["SET", "fleet", &id, "POINT", &lat, &lon]);
    }
    let snapshot_id = render(&must(&leader, &["SAVESNAPSHOT"]));
    for i in 1000..1200 {
        let id = format!("t{}", i);
        must(&leader, &["SET", "fleet", &id, "POINT", "10", "10"]);
    }

    // stand the follower up with the snapshot already local (the pull
    // helper's job) and point it at the leader
    let follower = Server::open(follower_dir.path()).unwrap();
    hand_snapshot_over(leader_dir.path(), follower_dir.path(), &snapshot_id);
    must(&follower, &["FOLLOW", "127.0.0.1", &addr.port().to_string()]);

    wait_caught_up(&follower);
    assert_eq!(dump(&follower, "fleet"), dump(&leader, "fleet"));

    // live tail: new leader writes appear on the follower
    must(&leader, &["SET", "fleet", "tail1", "POINT", "40", "40"]);
    must(&leader, &["DEL", "fleet", "t0"]);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let have_new = render(&must(&follower, &["GET", "fleet", "tail1", "POINT"])) == "[40 40]";
        let dropped_old = render(&must(&follower, &["GET", "fleet", "t0"])) == "nil";
        if have_new && dropped_old {
            break;
        }
        assert!(Instant::now() < deadline, "tail never applied");
        std::thread::sleep(Duration::from_millis(50));
    }

    // followers refuse writes
    assert!(matches!(
        cmd(&follower, &["SET", "fleet", "x", "POINT", "1", "1"]),
        Err(Error::NotLeader)
    ));

    // and a follower taken off its leader becomes writable again
    must(&follower, &["FOLLOW", "no", "one"]);
    must(&follower, &["SET", "fleet", "x", "POINT", "1", "1"]);

    follower.close();
    leader.close();
}

#[test]
fn test_follower_reset_replaces_local_state() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let leader = Server::open(leader_dir.path()).unwrap();
    let (addr, _handle) = leader.serve_replication("127.0.0.1:0").unwrap();
    for i in 0..100 {
        let id = format!("L{}", i);
        must(&leader, &["SET", "shared", &id, "POINT", "1", "1"]);
    }
    let snapshot_id = render(&must(&leader, &["SAVESNAPSHOT"]));

    // the follower starts with its own divergent history
    let follower = Server::open(follower_dir.path()).unwrap();
    for i in 0..50 {
        let id = format!("F{}", i);
        must(&follower, &["SET", "shared", &id, "POINT", "2", "2"]);
    }
    hand_snapshot_over(leader_dir.path(), follower_dir.path(), &snapshot_id);
    must(&follower, &["FOLLOW", "127.0.0.1", &addr.port().to_string()]);
    wait_caught_up(&follower);

    // the snapshot sync replaced the follower's own data wholesale
    assert_eq!(dump(&follower, "shared"), dump(&leader, "shared"));
    assert_eq!(render(&must(&follower, &["GET", "shared", "F0"])), "nil");

    follower.close();
    leader.close();
}

#[test]
fn test_reads_fail_while_catching_up() {
    let follower_dir = tempfile::tempdir().unwrap();
    let follower = Server::open(follower_dir.path()).unwrap();
    must(&follower, &["SET", "k", "a", "POINT", "1", "1"]);

    // point it at a leader that is not answering; the first sync can never
    // complete, so reads must report catching-up
    {
        let config_path = follower_dir.path().join("config");
        let mut config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&config_path).unwrap()).unwrap();
        config["follow_host"] = serde_json::json!("127.0.0.1");
        config["follow_port"] = serde_json::json!(1); // nothing listens here
        std::fs::write(&config_path, serde_json::to_vec(&config).unwrap()).unwrap();
    }
    follower.close();

    let follower = Server::open(follower_dir.path()).unwrap();
    assert!(matches!(
        cmd(&follower, &["GET", "k", "a"]),
        Err(Error::CatchingUp)
    ));
    assert!(matches!(
        cmd(&follower, &["SET", "k", "b", "POINT", "2", "2"]),
        Err(Error::NotLeader)
    ));
    follower.close();
}
