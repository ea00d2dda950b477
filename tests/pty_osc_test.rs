//! PTY session end-to-end: output fan-out, notification detection, exit.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use botster_hub::pty::PtySession;
use botster_hub::terminal::Notification;

fn wait_until<F: FnMut() -> bool>(mut predicate: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_osc_777_notification_reaches_channel() {
    // Emit ESC ] 777 ; notify ; Question ; Continue? BEL from the child.
    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("notify.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf '\\033]777;notify;Question;Continue?\\007'\nsleep 2\n",
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let mut session = PtySession::spawn(
        &format!("sh {}", script.display()),
        dir.path(),
        &HashMap::new(),
        24,
        80,
        tx,
    )
    .expect("spawn script");

    let got = wait_until(
        || {
            matches!(
                rx.try_recv(),
                Ok(Notification::Osc777 { ref title, .. }) if title == "Question"
            )
        },
        Duration::from_secs(5),
    );
    assert!(got, "OSC 777 notification never arrived");
    session.close();
}

#[test]
fn test_output_hash_changes_and_raw_drain() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("emit.sh");
    std::fs::write(&script, "#!/bin/sh\necho hello-from-agent\nsleep 2\n").unwrap();

    let (tx, _rx) = mpsc::channel();
    let mut session = PtySession::spawn(
        &format!("sh {}", script.display()),
        dir.path(),
        &HashMap::new(),
        24,
        80,
        tx,
    )
    .unwrap();

    let parser = session.parser();
    let initial_hash = parser.lock().unwrap().screen_hash();

    assert!(
        wait_until(
            || parser.lock().unwrap().screen_hash() != initial_hash,
            Duration::from_secs(5)
        ),
        "screen hash never changed"
    );

    let raw = session.drain_raw();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("hello-from-agent"));

    session.close();
}

#[test]
fn test_env_reaches_child() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("env.sh");
    std::fs::write(&script, "#!/bin/sh\necho \"repo=$BOTSTER_REPO\"\nsleep 2\n").unwrap();

    let mut env = HashMap::new();
    env.insert("BOTSTER_REPO".to_string(), "acme/demo".to_string());

    let (tx, _rx) = mpsc::channel();
    let mut session = PtySession::spawn(
        &format!("sh {}", script.display()),
        dir.path(),
        &env,
        24,
        80,
        tx,
    )
    .unwrap();

    let parser = session.parser();
    assert!(
        wait_until(
            || parser
                .lock()
                .unwrap()
                .rows_text()
                .join("\n")
                .contains("repo=acme/demo"),
            Duration::from_secs(5)
        ),
        "BOTSTER_REPO never reached the child"
    );

    session.close();
}
