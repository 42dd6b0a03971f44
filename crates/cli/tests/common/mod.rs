//! Common utilities for integration tests

#![allow(dead_code)]

use anyhow::Result;
use boxsync_core::{ChangeSet, VersionControl};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

/// Collaborator that only records what it was asked to do
#[derive(Default)]
pub struct RecordingVcs {
    pub check_ins: Mutex<Vec<ChangeSet>>,
    pub check_outs: Mutex<Vec<String>>,
    pub checkout_delay: Mutex<Duration>,
}

impl VersionControl for RecordingVcs {
    fn check_in(&self, changes: &ChangeSet) -> Result<Option<String>> {
        self.check_ins.lock().push(changes.clone());
        Ok(None)
    }

    fn check_out(&self, revision: &str) -> Result<()> {
        let delay = *self.checkout_delay.lock();
        thread::sleep(delay);
        self.check_outs.lock().push(revision.to_string());
        Ok(())
    }

    fn has_changes(&self, _revision: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Send one request the way the update hook does and return the reply
pub fn request(addr: SocketAddr, secret: &str, revision: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    write!(stream, "{}\n{}\n", secret, revision).unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    reply
}

pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}

pub fn tool_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Run git in `dir`, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Like [`git`] but reports failure instead of panicking
pub fn try_git(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
