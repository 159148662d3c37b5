use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::thread;

use mediarc_core::checksum::Checksum;
use mediarc_core::protocol::Response;
use mediarc_core::{archive, server, sums, ArchiveError, ArchiveOptions, VerifierConfig};
use tempfile::tempdir;

fn quiet(_: &str, _: u64, _: u64, _: &str) {}

fn write(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

/// Start a verification peer for `root` and return its port.
fn start_peer(root: &Path) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let root = root.to_path_buf();
    thread::spawn(move || server::serve(listener, &root));
    port
}

#[test]
fn test_batch_gets_one_answer_per_request_then_ack() {
    let dir = tempdir().unwrap();
    for i in 0..20 {
        write(&dir.path().join(format!("2020/01/02/{i}.jpg")), format!("body {i}").as_bytes());
    }
    let port = start_peer(dir.path());

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    for i in 0..20 {
        // Every third request carries a wrong checksum.
        let body = if i % 3 == 0 { "wrong".to_string() } else { format!("body {i}") };
        let sum = Checksum::of_reader(body.as_bytes()).unwrap();
        writeln!(stream, "2020/01/02/{i}.jpg\t{sum}").unwrap();
    }
    writeln!(stream, "done\tdone").unwrap();

    let mut lines = BufReader::new(stream).lines();
    let mut verdicts = Vec::new();
    loop {
        let line = lines.next().unwrap().unwrap();
        match Response::parse(&line).unwrap() {
            Some(Response::Done) => break,
            Some(Response::Verdict { path, matched }) => verdicts.push((path, matched)),
            None => {}
        }
    }

    assert_eq!(verdicts.len(), 20);
    for (i, (path, matched)) in verdicts.iter().enumerate() {
        assert_eq!(path, &format!("2020/01/02/{i}.jpg"));
        assert_eq!(*matched, i % 3 != 0);
    }
}

#[test]
fn test_archive_with_remote_verification() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write(&src.join("20220101120000.png"), b"same content");
    write(&src.join("20220101120001.png"), b"mine!");
    write(&src.join("20220101120002.png"), b"brand new");
    write(&dst.join("2022/01/01/20220101120000.png"), b"same content");
    write(&dst.join("2022/01/01/20220101120001.png"), b"yours");

    let port = start_peer(&dst);
    let mut options = ArchiveOptions::new(&src, &dst);
    options.concurrency = 2;
    options.verifier = VerifierConfig::Remote {
        host: "127.0.0.1".to_string(),
        port,
    };

    let first = archive(&options, &quiet).unwrap();
    assert_eq!((first.archived, first.duplicates, first.failed), (2, 1, 0));
    assert_eq!(fs::read(dst.join("2022/01/01/20220101120001.png")).unwrap(), b"yours");
    assert_eq!(fs::read(dst.join("2022/01/01/20220101120002.png")).unwrap(), b"brand new");

    let second = archive(&options, &quiet).unwrap();
    assert_eq!((second.archived, second.duplicates, second.failed), (0, 3, 0));
}

#[test]
fn test_unreachable_peer_aborts_before_any_work() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write(&src.join("20220101120000.png"), b"x");

    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut options = ArchiveOptions::new(&src, &dst);
    options.verifier = VerifierConfig::Remote {
        host: "127.0.0.1".to_string(),
        port,
    };

    let err = archive(&options, &quiet).unwrap_err();
    assert!(matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::Connect { .. })));
    assert!(!dst.join("2022").exists());
}

#[test]
fn test_listing_matches_an_archived_tree() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    for i in 0..12 {
        write(&src.join(format!("2023030412{i:02}00.png")), format!("shot {i}").as_bytes());
    }
    archive(&ArchiveOptions::new(&src, &dst), &quiet).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let root = dst.clone();
    thread::spawn(move || server::serve_sums(listener, &root));

    let paths = sums::relative_files(&dst).unwrap();
    assert_eq!(paths.len(), 12);
    let listed = sums::fetch(&addr, &paths).unwrap();
    assert_eq!(listed.len(), 12);
    for sum in listed {
        let name = sum.path.rsplit('/').next().unwrap();
        let local = Checksum::of_file(&src.join(name)).unwrap();
        assert!(local.matches_hex(sum.checksum.as_deref().unwrap()), "{}", sum.path);
    }
}
