//! Peers that answer checksum requests for files under a root.

use std::io::{self, BufRead, BufReader, LineWriter};
use std::net::{TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::thread;

use tracing::{debug, info, warn};

use crate::checksum::Checksum;
use crate::error::ProtocolError;
use crate::protocol::{Request, Response, MISS, OK};
use crate::sums;

type Handler = fn(TcpStream, &Path) -> Result<(), ProtocolError>;

/// Accept verification connections forever, one thread per connection.
pub fn serve(listener: TcpListener, root: &Path) -> io::Result<()> {
    accept_loop(listener, root, handle_connection)
}

/// Accept checksum listing connections forever, one thread per connection.
pub fn serve_sums(listener: TcpListener, root: &Path) -> io::Result<()> {
    accept_loop(listener, root, sums::handle_connection)
}

fn accept_loop(listener: TcpListener, root: &Path, handler: Handler) -> io::Result<()> {
    info!("listening on {} root={}", listener.local_addr()?, root.display());
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                info!("connection from {}", peer);
                let root = root.to_path_buf();
                thread::spawn(move || match handler(stream, &root) {
                    Ok(()) => info!("{} disconnected", peer),
                    Err(e) => warn!("connection {} closed: {}", peer, e),
                });
            }
            Err(e) => warn!("accept error: {}", e),
        }
    }
    Ok(())
}

/// Serve one client until it disconnects. Requests are answered in the
/// order they arrive, so a `done` ack always follows every earlier verdict.
pub fn handle_connection(stream: TcpStream, root: &Path) -> Result<(), ProtocolError> {
    let reader = BufReader::new(stream.try_clone()?);
    let mut out = LineWriter::new(stream);
    let mut answered = 0u64;

    for line in reader.lines() {
        let line = line?;
        match Request::parse(&line)? {
            None => continue,
            Some(Request::Done) => {
                Response::Done.write_to(&mut out)?;
                info!("batch done, {} request(s) answered", answered);
                answered = 0;
            }
            Some(Request::Verify { path, checksum }) => {
                let matched = verify(root, &path, &checksum);
                Response::Verdict { path, matched }.write_to(&mut out)?;
                answered += 1;
            }
        }
    }
    Ok(())
}

/// `root/<relative>` if `relative` stays inside `root`.
pub(crate) fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let inside = relative.components().all(|c| matches!(c, Component::Normal(_)));
    inside.then(|| root.join(relative))
}

fn verify(root: &Path, relative: &str, checksum: &str) -> bool {
    let Some(local) = resolve(root, relative) else {
        warn!("rejecting path outside root: {:?}", relative);
        return false;
    };
    match Checksum::of_file(&local) {
        Ok(sum) => {
            let matched = sum.matches_hex(checksum);
            debug!("{} {}", relative, if matched { OK } else { MISS });
            matched
        }
        Err(e) => {
            warn!("cannot read {}: {}", local.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    fn start(root: &Path) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let root = root.to_path_buf();
        thread::spawn(move || serve(listener, &root));
        addr
    }

    #[test]
    fn test_resolve_stays_inside_root() {
        let root = Path::new("/archive");
        assert_eq!(resolve(root, "2020/01/02/a.jpg"), Some(PathBuf::from("/archive/2020/01/02/a.jpg")));
        assert_eq!(resolve(root, "../etc/passwd"), None);
        assert_eq!(resolve(root, "/etc/passwd"), None);
    }

    #[test]
    fn test_serve_answers_in_order() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("2020/01/02")).unwrap();
        fs::write(dir.path().join("2020/01/02/a.jpg"), b"abc").unwrap();
        let good = Checksum::of_reader(&b"abc"[..]).unwrap().to_hex();

        let addr = start(dir.path());
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "2020/01/02/a.jpg\t{good}\n\n2020/01/02/a.jpg\t00\n../escape.jpg\t{good}\nmissing.jpg\t{good}\ndone\tdone\n"
        )
        .unwrap();

        let mut lines = BufReader::new(stream.try_clone().unwrap()).lines();
        let mut next = || lines.next().unwrap().unwrap();
        assert_eq!(next(), "2020/01/02/a.jpg\tok");
        assert_eq!(next(), "2020/01/02/a.jpg\tmiss");
        assert_eq!(next(), "../escape.jpg\tmiss");
        assert_eq!(next(), "missing.jpg\tmiss");
        assert_eq!(next(), "done\tdone");

        // The connection stays usable for another batch.
        write!(stream, "2020/01/02/a.jpg\t{good}\ndone\tdone\n").unwrap();
        assert_eq!(next(), "2020/01/02/a.jpg\tok");
        assert_eq!(next(), "done\tdone");
    }

    #[test]
    fn test_malformed_line_closes_connection() {
        let dir = tempdir().unwrap();
        let addr = start(dir.path());
        let mut stream = TcpStream::connect(addr).unwrap();
        writeln!(stream, "no fields here").unwrap();

        let mut lines = BufReader::new(stream).lines();
        assert!(!matches!(lines.next(), Some(Ok(_))));
    }
}
