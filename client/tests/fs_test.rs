//! End-to-end scenarios against an in-process server: the request surface
//! is driven directly (the same functions the FUSE dispatcher calls), so
//! no kernel is involved.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;

use client::api_client::ApiClient;
use client::config::Config;
use client::error::Kind;
use client::fs::{attr, create, delete, link, read, rename, write, Invalidator, RemoteFs, ROOT_INO};
use client::keys::Factotum;
use server::{spawn_inprocess, InProcessServer, ServerConfig};

const USER: &str = "tester@example.org";
const WRITER: &str = "writer@example.org";

struct Mount {
    fs: Arc<RemoteFs>,
    srv: InProcessServer,
    _tmp: tempfile::TempDir,
}

fn mount(block_size: usize, watch: bool) -> Mount {
    let srv = spawn_inprocess(ServerConfig { watch_supported: watch });
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        server_url: srv.url(),
        user: USER.to_string(),
        cache_dir: tmp.path().join("cache"),
        cache_size: 1 << 30,
        block_size,
        ..Config::default()
    };
    let fs = RemoteFs::new(config, &tmp.path().join("mnt")).unwrap();
    fs.startup();
    Mount { fs, srv, _tmp: tmp }
}

/// A second writer talking to the same server, bypassing the mount.
struct SideWriter {
    rt: tokio::runtime::Runtime,
    api: ApiClient,
}

impl SideWriter {
    fn new(m: &Mount, block_size: usize) -> SideWriter {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let api =
            ApiClient::new(&m.srv.url(), WRITER, Arc::new(Factotum::generate()), block_size)
                .unwrap();
        rt.block_on(api.register_key()).unwrap();
        SideWriter { rt, api }
    }

    fn put(&self, path: &str, data: &[u8]) {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        self.rt.block_on(self.api.put(path, data, now)).unwrap();
    }

    fn mkdir(&self, path: &str) {
        self.rt.block_on(self.api.make_directory(path)).unwrap();
    }

    fn delete(&self, path: &str) {
        self.rt.block_on(self.api.delete(path)).unwrap();
    }
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

fn ino_of(fs: &Arc<RemoteFs>, path: &str) -> u64 {
    let mut ino = ROOT_INO;
    for comp in path.split('/') {
        ino = read::lookup(fs, ino, comp).unwrap().ino;
    }
    ino
}

fn write_file(fs: &Arc<RemoteFs>, dir: u64, name: &str, data: &[u8]) -> u64 {
    let (fattr, fh) = create::create(fs, dir, name, 0o644, 0).unwrap();
    write::write(fs, fattr.ino, fh, 0, data).unwrap();
    write::release(fs, fattr.ino, fh).unwrap();
    fattr.ino
}

fn read_range(fs: &Arc<RemoteFs>, ino: u64, offset: u64, len: usize) -> Vec<u8> {
    let fh = read::open(fs, ino, libc::O_RDONLY).unwrap();
    let data = read::read(fs, ino, fh, offset, len).unwrap();
    write::release(fs, ino, fh).unwrap();
    data
}

fn poll_until(deadline: Duration, mut f: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    loop {
        if f() {
            return true;
        }
        if Instant::now() > end {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn write_read_rewrite() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let t1 = create::mkdir(&m.fs, root, "t1").unwrap().ino;

    let b = random_bytes(16384);
    let (fattr, fh) = create::create(&m.fs, t1, "f", 0o644, 0).unwrap();
    write::write(&m.fs, fattr.ino, fh, 0, &b).unwrap();

    // Pre-close read comes straight from the dirty cache file.
    let got = read::read(&m.fs, fattr.ino, fh, 0, 16384).unwrap();
    assert_eq!(got, b);
    write::release(&m.fs, fattr.ino, fh).unwrap();

    // Close, reopen, read again: now through the store path.
    let ino = ino_of(&m.fs, &format!("{}/t1/f", USER));
    assert_eq!(read_range(&m.fs, ino, 0, 16384), b);

    // Overwrite the first half and check the splice.
    let b2 = random_bytes(8192);
    let fh = read::open(&m.fs, ino, libc::O_WRONLY).unwrap();
    write::write(&m.fs, ino, fh, 0, &b2).unwrap();
    write::release(&m.fs, ino, fh).unwrap();

    let got = read_range(&m.fs, ino, 0, 16384);
    assert_eq!(&got[..8192], &b2[..]);
    assert_eq!(&got[8192..], &b[8192..]);
}

#[test]
fn truncate_up_and_down() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let t1 = create::mkdir(&m.fs, root, "t1").unwrap().ino;
    let b = random_bytes(16384);
    let ino = write_file(&m.fs, t1, "f", &b);

    // Shrink while closed: open-truncate-release under the covers.
    attr::setattr(&m.fs, ino, Some(8192), None, None).unwrap();
    let got = read_range(&m.fs, ino, 0, 16384);
    assert_eq!(got, &b[..8192]);

    // Grow again: the tail is zeros.
    attr::setattr(&m.fs, ino, Some(16384), None, None).unwrap();
    let got = read_range(&m.fs, ino, 0, 16384);
    assert_eq!(&got[..8192], &b[..8192]);
    assert!(got[8192..].iter().all(|&x| x == 0));
    assert_eq!(got.len(), 16384);
}

#[test]
fn extend_across_block_boundary() {
    const S: usize = 65536;
    let m = mount(S, true);
    let root = ino_of(&m.fs, USER);
    let t2 = create::mkdir(&m.fs, root, "t2").unwrap().ino;

    let b1 = random_bytes(16384);
    let ino = write_file(&m.fs, t2, "f", &b1);

    let b2 = random_bytes(16384);
    let fh = read::open(&m.fs, ino, libc::O_RDWR).unwrap();
    write::write(&m.fs, ino, fh, (S - 3) as u64, &b2).unwrap();
    write::release(&m.fs, ino, fh).unwrap();

    assert_eq!(read_range(&m.fs, ino, 0, 16384), b1);
    assert_eq!(read_range(&m.fs, ino, (S - 3) as u64, 16384), b2);
    let hole = read_range(&m.fs, ino, (S - 3 - 16384) as u64, 16384);
    assert!(hole.iter().all(|&x| x == 0));
    assert_eq!(hole.len(), 16384);
}

#[test]
fn symlink_up_and_back() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let t3 = create::mkdir(&m.fs, root, "t3").unwrap().ino;
    let dir = create::mkdir(&m.fs, t3, "dir").unwrap().ino;
    let sub = create::mkdir(&m.fs, dir, "sub").unwrap().ino;

    let content = b"the real thing".to_vec();
    write_file(&m.fs, dir, "real1", &content);

    let target = format!("../../../../{}/t3/dir/real1", USER);
    let lattr = link::symlink(&m.fs, sub, "updown", Path::new(&target)).unwrap();
    assert_eq!(lattr.kind, fuser::FileType::Symlink);

    // readlink reports the walk-up-walk-down form.
    let rendered = link::readlink(&m.fs, lattr.ino).unwrap();
    assert_eq!(rendered, "../real1");
    assert_eq!(lattr.size, rendered.len() as u64);

    // "Read through" the link the way the kernel would: resolve the
    // rendering against the link's directory, then read the target.
    let resolved = ino_of(&m.fs, &format!("{}/t3/dir/real1", USER));
    assert_eq!(read_range(&m.fs, resolved, 0, 64), content);

    // Targets that leave the mount are refused outright.
    let err = link::symlink(&m.fs, sub, "escape", Path::new("../../../../../etc/passwd"))
        .unwrap_err();
    assert_eq!(err.kind, Kind::Invalid);
}

#[test]
fn eventual_consistency_through_the_watcher() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let t4 = create::mkdir(&m.fs, root, "t4").unwrap().ino;

    // Give the watcher a moment to be on the wire, then seed a negative
    // lookup so only a notification can resurrect the name quickly.
    std::thread::sleep(Duration::from_millis(500));
    assert!(read::lookup(&m.fs, t4, "f").is_err());

    let side = SideWriter::new(&m, 4096);
    side.put(&format!("{}/t4/f", USER), b"appeared remotely");

    assert!(
        poll_until(Duration::from_secs(5), || read::lookup(&m.fs, t4, "f").is_ok()),
        "creation never became visible"
    );

    side.delete(&format!("{}/t4/f", USER));
    assert!(
        poll_until(Duration::from_secs(5), || {
            matches!(read::lookup(&m.fs, t4, "f"), Err(e) if e.kind == Kind::NotExist)
        }),
        "deletion never became visible"
    );
}

#[test]
fn demand_block_loading() {
    const S: usize = 4096;
    let m = mount(S, true);
    // Make sure the owner root (and watcher) exist before the side write.
    let _ = ino_of(&m.fs, USER);

    let side = SideWriter::new(&m, S);
    side.mkdir(&format!("{}/t6", USER));
    let data = random_bytes(4 * S);
    side.put(&format!("{}/t6/f", USER), &data);

    let ino = ino_of(&m.fs, &format!("{}/t6/f", USER));
    let before = m.srv.state.total_fetches();

    let fh = read::open(&m.fs, ino, libc::O_RDONLY).unwrap();
    assert_eq!(m.srv.state.total_fetches(), before, "open fetched eagerly");

    let got = read::read(&m.fs, ino, fh, 0, 128).unwrap();
    assert_eq!(got, &data[..128]);
    let got = read::read(&m.fs, ino, fh, S as u64, 128).unwrap();
    assert_eq!(got, &data[S..S + 128]);
    assert_eq!(m.srv.state.total_fetches(), before + 2, "expected two demand loads");
    write::release(&m.fs, ino, fh).unwrap();

    // Reopen: loaded blocks stay loaded, new ranges load exactly what
    // they touch.
    let fh = read::open(&m.fs, ino, libc::O_RDONLY).unwrap();
    let got = read::read(&m.fs, ino, fh, 0, 128).unwrap();
    assert_eq!(got, &data[..128]);
    let n = 100u64;
    let got = read::read(&m.fs, ino, fh, S as u64 + n, 128).unwrap();
    assert_eq!(got, &data[S + n as usize..S + n as usize + 128]);
    assert_eq!(m.srv.state.total_fetches(), before + 2, "cached ranges re-fetched");
    let got = read::read(&m.fs, ino, fh, 2 * S as u64, 128).unwrap();
    assert_eq!(got, &data[2 * S..2 * S + 128]);
    assert_eq!(m.srv.state.total_fetches(), before + 3, "expected one new demand load");
    write::release(&m.fs, ino, fh).unwrap();
}

#[test]
fn rename_is_atomic_at_the_api() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let t5 = create::mkdir(&m.fs, root, "t5").unwrap().ino;
    let content = random_bytes(2048);
    write_file(&m.fs, t5, "a", &content);

    rename::rename(&m.fs, t5, "a", t5, "b").unwrap();

    let err = read::lookup(&m.fs, t5, "a").unwrap_err();
    assert_eq!(err.kind, Kind::NotExist);
    let ino = read::lookup(&m.fs, t5, "b").unwrap().ino;
    assert_eq!(read_range(&m.fs, ino, 0, 2048), content);
}

#[test]
fn rename_replaces_an_existing_destination() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let t5 = create::mkdir(&m.fs, root, "t5").unwrap().ino;
    let winner = random_bytes(1024);
    write_file(&m.fs, t5, "a", &winner);
    write_file(&m.fs, t5, "b", &random_bytes(512));

    // The server answers exist; the surface deletes and retries once.
    rename::rename(&m.fs, t5, "a", t5, "b").unwrap();

    let ino = read::lookup(&m.fs, t5, "b").unwrap().ino;
    assert_eq!(read_range(&m.fs, ino, 0, 1024), winner);
    assert_eq!(read::lookup(&m.fs, t5, "a").unwrap_err().kind, Kind::NotExist);
}

#[test]
fn remove_file_and_directory() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let d = create::mkdir(&m.fs, root, "doomed").unwrap().ino;
    write_file(&m.fs, d, "f", b"bytes");

    // rmdir of a non-empty directory is refused with not-empty.
    let err = delete::rmdir(&m.fs, root, "doomed").unwrap_err();
    assert_eq!(err.kind, Kind::NotEmpty);
    // unlink of a directory is refused with is-dir.
    let err = delete::unlink(&m.fs, root, "doomed").unwrap_err();
    assert_eq!(err.kind, Kind::IsDir);

    delete::unlink(&m.fs, d, "f").unwrap();
    assert_eq!(read::lookup(&m.fs, d, "f").unwrap_err().kind, Kind::NotExist);
    delete::rmdir(&m.fs, root, "doomed").unwrap();
    assert_eq!(read::lookup(&m.fs, root, "doomed").unwrap_err().kind, Kind::NotExist);
}

#[test]
fn readdir_lists_children_and_root_lists_users() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let d = create::mkdir(&m.fs, root, "listing").unwrap().ino;
    write_file(&m.fs, d, "one", b"1");
    write_file(&m.fs, d, "two", b"22");
    create::mkdir(&m.fs, d, "sub").unwrap();

    let names: Vec<String> =
        read::readdir(&m.fs, d).unwrap().into_iter().map(|(_, _, n)| n).collect();
    assert!(names.contains(&"one".to_string()));
    assert!(names.contains(&"two".to_string()));
    assert!(names.contains(&"sub".to_string()));

    let top: Vec<String> =
        read::readdir(&m.fs, ROOT_INO).unwrap().into_iter().map(|(_, _, n)| n).collect();
    assert!(top.contains(&USER.to_string()));
}

#[test]
fn pull_refresh_when_watch_is_unsupported() {
    let m = mount(4096, false);
    let root = ino_of(&m.fs, USER);
    let t = create::mkdir(&m.fs, root, "poll").unwrap().ino;

    // Negative lookups only hold for the short interval on servers
    // without notifications.
    assert!(read::lookup(&m.fs, t, "late").is_err());
    let side = SideWriter::new(&m, 4096);
    side.put(&format!("{}/poll/late", USER), b"finally");

    assert!(
        poll_until(Duration::from_secs(8), || read::lookup(&m.fs, t, "late").is_ok()),
        "file never appeared through the pull path"
    );
}

#[test]
fn shadow_names_are_short_circuited() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let err = read::lookup(&m.fs, root, "._shadow").unwrap_err();
    assert_eq!(err.kind, Kind::NotExist);
}

#[test]
fn mtime_survives_setattr() {
    let m = mount(4096, true);
    let root = ino_of(&m.fs, USER);
    let d = create::mkdir(&m.fs, root, "times").unwrap().ino;
    let ino = write_file(&m.fs, d, "f", b"dated");

    let then = UNIX_EPOCH + Duration::from_secs(1_500_000_000);
    let got = attr::setattr(&m.fs, ino, None, Some(then), None).unwrap();
    assert_eq!(got.mtime, then);
    // And it sticks across a fresh stat.
    let again = attr::getattr(&m.fs, ino).unwrap();
    assert_eq!(again.mtime, then);
}

struct Recorder(parking_lot::Mutex<Vec<u64>>);

impl Invalidator for Recorder {
    fn invalidate_attr(&self, ino: u64) {
        self.0.lock().push(ino);
    }
    fn invalidate_data(&self, ino: u64) {
        self.0.lock().push(ino);
    }
}

#[test]
fn remote_updates_queue_kernel_invalidations() {
    let m = mount(4096, true);
    let recorder = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));
    m.fs.set_invalidator(recorder.clone());

    let root = ino_of(&m.fs, USER);
    let t = create::mkdir(&m.fs, root, "inval").unwrap().ino;
    let ino = write_file(&m.fs, t, "f", b"v1");
    std::thread::sleep(Duration::from_millis(500));

    let side = SideWriter::new(&m, 4096);
    side.put(&format!("{}/inval/f", USER), b"v2 from elsewhere");

    assert!(
        poll_until(Duration::from_secs(5), || recorder.0.lock().contains(&ino)),
        "no invalidation for the updated node"
    );
}
