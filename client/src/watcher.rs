//! Keeping the local graph coherent with asynchronous remote changes.
//!
//! Each user with at least one live node has a background task consuming
//! that root's change feed. The task reconnects with exponential backoff
//! (1 s doubling to 60 s, reset on success), restarts from sequence "new"
//! when the server declares the sequence invalid, and drains the stream
//! before quitting so the transport is never left half-read. Servers
//! without watch support push nodes onto the pull-refresh path instead.
//!
//! Event application order matters: enoent scrubbing under the filesystem
//! lock, the decision under the node lock, map surgery after both, and
//! the kernel invalidation from its own thread outside every lock.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{Kind, Result};
use crate::fs::{FsMaps, RemoteFs, REFRESH_LONG, REFRESH_SHORT};
use crate::node::{Node, NodeKind};
use crate::proto::WatchEvent;
use crate::rpath;

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEIL: Duration = Duration::from_secs(60);

/// Per-user subscription state, stored in the filesystem's watched map.
pub struct WatchedRoot {
    /// Live nodes under this user.
    pub refs: usize,
    /// What the server said about watch support; None until known.
    pub supported: Option<bool>,
    die: watch::Sender<bool>,
}

/// Bump the subscription for `user`, starting its watcher task on first
/// reference. Called with the filesystem lock held.
pub fn attach_watch(fs: &Arc<RemoteFs>, maps: &mut FsMaps, user: &str) {
    if let Some(w) = maps.watched.get_mut(user) {
        w.refs += 1;
        return;
    }
    let (die_tx, die_rx) = watch::channel(false);
    maps.watched.insert(
        user.to_string(),
        WatchedRoot { refs: 1, supported: None, die: die_tx },
    );
    tracing::debug!(user, "starting watcher");
    let weak = Arc::downgrade(fs);
    let user = user.to_string();
    fs.runtime.spawn(watch_user(weak, user, die_rx));
}

/// Drop one reference; the last one signals the task to die. Called with
/// the filesystem lock held.
pub fn detach_watch(_fs: &Arc<RemoteFs>, maps: &mut FsMaps, user: &str) {
    let done = match maps.watched.get_mut(user) {
        Some(w) => {
            w.refs = w.refs.saturating_sub(1);
            w.refs == 0
        }
        None => false,
    };
    if done {
        if let Some(w) = maps.watched.remove(user) {
            tracing::debug!(user, "stopping watcher");
            let _ = w.die.send(true);
        }
    }
}

fn set_supported(fs: &RemoteFs, user: &str, supported: bool) {
    let mut maps = fs.lock_maps();
    if let Some(w) = maps.watched.get_mut(user) {
        w.supported = Some(supported);
    }
}

enum StreamEnd {
    Die,
    Invalid,
    Broken,
}

async fn watch_user(fs: Weak<RemoteFs>, user: String, mut die: watch::Receiver<bool>) {
    let mut sequence = String::from("new");
    let mut backoff = BACKOFF_FLOOR;
    loop {
        if *die.borrow() {
            return;
        }
        let Some(fs_strong) = fs.upgrade() else { return };
        let connected = fs_strong.client.watch(&user, &sequence).await;
        match connected {
            Err(e) if e.kind == Kind::NotSupported => {
                tracing::info!(user, "no watch support; nodes will pull-refresh");
                set_supported(&fs_strong, &user, false);
                return;
            }
            Err(e) => {
                tracing::debug!(user, error = %e, "watch connect failed");
                drop(fs_strong);
                if sleep_backoff(&mut die, &mut backoff).await {
                    return;
                }
            }
            Ok(mut stream) => {
                set_supported(&fs_strong, &user, true);
                backoff = BACKOFF_FLOOR;
                drop(fs_strong);
                let end = run_stream(&fs, &mut sequence, &mut die, &mut stream).await;
                // Always drain: the transport must not be left half-read.
                stream.close().await;
                match end {
                    StreamEnd::Die => return,
                    StreamEnd::Invalid => {
                        // Sequence or log corruption: start over, now.
                        sequence = String::from("new");
                    }
                    StreamEnd::Broken => {
                        if sleep_backoff(&mut die, &mut backoff).await {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn run_stream(
    fs: &Weak<RemoteFs>,
    sequence: &mut String,
    die: &mut watch::Receiver<bool>,
    stream: &mut crate::api_client::WatchStream,
) -> StreamEnd {
    loop {
        tokio::select! {
            changed = die.changed() => {
                if changed.is_err() || *die.borrow() {
                    return StreamEnd::Die;
                }
            }
            event = stream.next_event() => {
                let Some(event) = event else { return StreamEnd::Broken };
                if let Some(err) = &event.error {
                    if err == "invalid" {
                        return StreamEnd::Invalid;
                    }
                    tracing::debug!(error = %err, "watch stream error");
                    return StreamEnd::Broken;
                }
                *sequence = event.entry.sequence.to_string();
                let Some(fs_strong) = fs.upgrade() else { return StreamEnd::Die };
                handle_event(&fs_strong, event);
            }
        }
    }
}

async fn sleep_backoff(die: &mut watch::Receiver<bool>, backoff: &mut Duration) -> bool {
    let wait = *backoff;
    *backoff = (*backoff * 2).min(BACKOFF_CEIL);
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = die.changed() => true,
    }
}

/// Apply one change event to the local graph.
pub fn handle_event(fs: &Arc<RemoteFs>, event: WatchEvent) {
    let path = event.entry.name.clone();
    tracing::debug!(path = %path, delete = event.delete, seq = event.entry.sequence, "watch event");

    {
        let mut maps = fs.lock_maps();
        if !event.delete {
            maps.enoent.remove(&path);
        }
        if let Some(parent) = rpath::parent(&path) {
            maps.enoent.remove(parent);
        }
    }
    fs.dircache.drop_parent_of(&path);
    if event.delete {
        fs.dircache.drop_dir(&path);
    }

    let Some(node) = fs.node_by_path(&path) else { return };

    enum Apply {
        Drop,
        Delete,
        Unmap,
        Updated,
    }

    let apply = {
        let mut st = node.lock();
        if st.path != path {
            // Renamed locally since the event was cut; stale name.
            Apply::Drop
        } else if event.entry.sequence <= st.sequence {
            Apply::Drop
        } else if st.cf.as_ref().map_or(false, |cf| cf.dirty) {
            // Local writes win until written back.
            Apply::Drop
        } else if event.delete {
            Apply::Delete
        } else if st.cf.is_some() {
            // A clean cached copy is now stale; unmap so the next open
            // fetches the new version.
            Apply::Unmap
        } else {
            st.absorb_entry(&event.entry);
            Apply::Updated
        }
    };

    match apply {
        Apply::Drop => return,
        Apply::Delete => {
            fs.does_not_exist(&path);
            // The local copy is stale garbage now; open handles keep
            // their file alive through the fd, everyone else loses it.
            let taken = {
                let mut st = node.lock();
                if st.handles.is_empty() { st.cf.take() } else { None }
            };
            if let Some(cf) = taken {
                fs.cache.forget(cf);
            }
        }
        Apply::Unmap => fs.unmap(&path, &node),
        Apply::Updated => {}
    }
    fs.queue_invalidation(node.ino);
}

/// Pull-refresh fallback for nodes whose server does not stream changes.
/// Cheap no-op in every other case.
pub fn refresh(fs: &Arc<RemoteFs>, node: &Arc<Node>) -> Result<()> {
    let (path, user, skip) = {
        let st = node.lock();
        let skip = st.kind != NodeKind::Other
            || !st.handles.is_empty()
            || st.do_not_refresh
            || st.refresh_at > Instant::now();
        (st.path.clone(), st.user.clone(), skip)
    };
    if skip {
        return Ok(());
    }

    if fs.watch_supported(&user) == Some(true) {
        // The watcher keeps this node fresh from here on.
        node.lock().do_not_refresh = true;
        return Ok(());
    }

    match fs.block_on(fs.client.lookup(&path)) {
        Err(e) => {
            node.lock().refresh_at = Instant::now() + REFRESH_SHORT;
            fs.unmap(&path, node);
            Err(e)
        }
        Ok(crate::api_client::LookupOutcome::FollowLink(_)) => Ok(()),
        Ok(crate::api_client::LookupOutcome::Entry(entry)) => {
            let ino = node.ino;
            let changed = {
                let mut st = node.lock();
                st.refresh_at = Instant::now() + REFRESH_LONG;
                if entry.sequence == st.sequence {
                    false
                } else {
                    st.absorb_entry(&entry);
                    true
                }
            };
            if changed {
                fs.queue_invalidation(ino);
            }
            Ok(())
        }
    }
}
