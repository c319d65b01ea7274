//! End-to-end tests: a real server on an ephemeral port, driven over TCP.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use webserv::{Server, parse_config};

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn fixture(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("webserv-e2e-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(root.join("cgi")).unwrap();
    fs::create_dir_all(root.join("dir")).unwrap();
    fs::write(root.join("hello.txt"), "hello world\n").unwrap();
    fs::write(root.join("dir/one.txt"), "1").unwrap();
    fs::write(root.join("dir/two.txt"), "2").unwrap();
    fs::write(
        root.join("cgi/slow.sh"),
        "sleep 1\nprintf 'Content-Type: text/plain\\r\\n\\r\\nslow'\n",
    )
    .unwrap();
    fs::write(
        root.join("cgi/fail.sh"),
        "printf 'Content-Type: text/plain\\r\\n\\r\\nnot this'\nexit 1\n",
    )
    .unwrap();
    fs::write(
        root.join("cgi/echo.sh"),
        "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s|' \"$REQUEST_METHOD\" \"$QUERY_STRING\"\ncat\n",
    )
    .unwrap();
    fs::write(root.join("cgi/hang.sh"), "echo $$ > hang.pid\nexec sleep 30\n").unwrap();
    fs::create_dir_all(root.join("private")).unwrap();
    fs::write(root.join("private/index.html"), "members only").unwrap();
    fs::write(root.join("users"), "admin:secret\n").unwrap();
    root
}

fn start(root: &PathBuf, max_requests: usize) -> SocketAddr {
    start_with(root, max_requests, "{ client: 5, cgi: 5, max: 60 }")
}

fn start_with(root: &PathBuf, max_requests: usize, timeouts: &str) -> SocketAddr {
    let yaml = format!(
        r#"
max_requests: {max_requests}
timeouts: {timeouts}
servers:
  - name: e2e
    host: 127.0.0.1
    port: 0
    root: {root}
    autoindex: true
    locations:
      /cgi:
        methods: [GET, POST]
        cgi: {{ ".sh": /bin/sh }}
      /private:
        auth_basic: {{ realm: staff, user_file: {users} }}
      /upload:
        methods: [PUT]
        max_body_size: 1024
"#,
        root = root.display(),
        users = root.join("users").display()
    );
    let config = parse_config(&yaml).unwrap();
    let mut server = Server::new(config).unwrap();
    server.bind().unwrap();
    let addr = server.local_addrs()[0];
    std::thread::spawn(move || {
        let _ = server.run();
    });
    addr
}

fn connect(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

fn read_reply(reader: &mut BufReader<TcpStream>, head_only: bool) -> Reply {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let status = line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.to_string(), value.trim().to_string()));
    }
    let mut reply = Reply {
        status,
        headers,
        body: Vec::new(),
    };
    if head_only {
        return reply;
    }

    if reply.header("Transfer-Encoding") == Some("chunked") {
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).unwrap();
            let size = usize::from_str_radix(size.trim(), 16).unwrap();
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                break;
            }
            reply.body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = reply.header("Content-Length") {
        let mut body = vec![0u8; len.parse().unwrap()];
        reader.read_exact(&mut body).unwrap();
        reply.body = body;
    }
    reply
}

fn assert_closed(reader: &mut BufReader<TcpStream>) {
    let mut buf = [0u8; 1];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
}

/// Waits for a killed CGI child to be reaped.
fn assert_reaped(root: &PathBuf) {
    let pid = fs::read_to_string(root.join("cgi/hang.pid")).unwrap();
    let proc_dir = PathBuf::from("/proc").join(pid.trim());
    for _ in 0..100 {
        if !proc_dir.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("cgi child {} still present", pid.trim());
}

#[test]
fn test_static_file_is_streamed_chunked() {
    let root = fixture("static");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Transfer-Encoding"), Some("chunked"));
    assert_eq!(reply.header("Content-Type"), Some("text/plain; charset=utf-8"));
    assert!(reply.header("Last-Modified").is_some());
    assert_eq!(reply.body, b"hello world\n");

    stream
        .write_all(b"HEAD /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, true);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Length"), Some("12"));
}

#[test]
fn test_http10_gets_length_and_close() {
    let root = fixture("http10");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream.write_all(b"GET /hello.txt HTTP/1.0\r\n\r\n").unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Length"), Some("12"));
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_closed(&mut reader);
}

#[test]
fn test_max_requests_closes_after_last() {
    let root = fixture("max");
    let addr = start(&root, 3);
    let (mut stream, mut reader) = connect(addr);

    for i in 1..=3 {
        stream
            .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let reply = read_reply(&mut reader, false);
        assert_eq!(reply.status, 200);
        if i < 3 {
            assert_eq!(reply.header("Connection"), Some("keep-alive"));
            let expected = format!("timeout=5, max={}", 3 - i);
            assert_eq!(reply.header("Keep-Alive"), Some(expected.as_str()));
        } else {
            assert_eq!(reply.header("Connection"), Some("close"));
        }
    }
    assert_closed(&mut reader);
}

#[test]
fn test_pipelined_responses_keep_request_order() {
    let root = fixture("pipeline");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream
        .write_all(
            b"GET /cgi/slow.sh HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .unwrap();

    let first = read_reply(&mut reader, false);
    assert_eq!(first.status, 200);
    assert_eq!(first.text(), "slow");

    let second = read_reply(&mut reader, false);
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"hello world\n");
    assert_closed(&mut reader);
}

#[test]
fn test_failing_cgi_is_bad_gateway() {
    let root = fixture("cgifail");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream
        .write_all(b"GET /cgi/fail.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 502);
    assert!(!reply.text().contains("not this"));
}

#[test]
fn test_cgi_receives_body_and_environment() {
    let root = fixture("cgiecho");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream
        .write_all(
            b"POST /cgi/echo.sh?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\r\nping",
        )
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "POST|x=1|ping");

    stream
        .write_all(
            b"POST /cgi/echo.sh HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.text(), "POST||abcde");
}

#[test]
fn test_put_then_get_round_trip() {
    let root = fixture("put");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    let payload = b"binary\x00payload\xff";
    let head = format!(
        "PUT /upload.bin HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(payload).unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 201);
    assert_eq!(reply.text(), "File created.\n");

    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(payload).unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 201);
    assert_eq!(reply.text(), "File overwritten.\n");

    stream
        .write_all(b"GET /upload.bin HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, payload);
}

#[test]
fn test_delete_missing_twice_is_not_found() {
    let root = fixture("delete");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    for _ in 0..2 {
        stream
            .write_all(b"DELETE /nothing-here.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let reply = read_reply(&mut reader, false);
        assert_eq!(reply.status, 404);
    }

    stream
        .write_all(b"DELETE /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    assert!(!root.join("hello.txt").exists());
}

#[test]
fn test_directory_redirect_then_listing() {
    let root = fixture("listing");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream
        .write_all(b"GET /dir HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 301);
    assert_eq!(reply.header("Location"), Some("/dir/"));
    assert!(!reply.text().contains("<a href"));

    stream
        .write_all(b"GET /dir/ HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    let page = reply.text();
    let names: Vec<String> = fs::read_dir(root.join("dir"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(page.matches("<a href=").count(), names.len());
    let positions: Vec<usize> = names
        .iter()
        .map(|n| page.find(&format!("href=\"/dir/{}\"", n)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_bad_requests_are_answered_then_closed() {
    let root = fixture("bad");
    let addr = start(&root, 10);

    let (mut stream, mut reader) = connect(addr);
    stream.write_all(b"GET nope HTTP/1.1\r\n\r\n").unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_closed(&mut reader);

    let (mut stream, mut reader) = connect(addr);
    stream.write_all(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut reader, false).status, 501);

    let (mut stream, mut reader) = connect(addr);
    stream
        .write_all(b"GET / HTTP/1.1\r\nX-Unknown: 1\r\n\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut reader, false).status, 400);

    let (mut stream, mut reader) = connect(addr);
    stream.write_all(b"GET /../etc/passwd HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(read_reply(&mut reader, false).status, 403);
}

#[test]
fn test_stalled_request_gets_408() {
    let root = fixture("stall");
    let addr = start_with(&root, 10, "{ client: 1, cgi: 5, max: 60 }");

    for partial in [&b"GET /hel"[..], &b"GET /hello.txt HTTP/1.1\r\nHost: a\r\n"[..]] {
        let (mut stream, mut reader) = connect(addr);
        stream.write_all(partial).unwrap();
        let reply = read_reply(&mut reader, false);
        assert_eq!(reply.status, 408);
        assert_eq!(reply.header("Connection"), Some("close"));
        assert_closed(&mut reader);
    }

    let (_stream, mut reader) = connect(addr);
    assert_closed(&mut reader);
}

#[test]
fn test_cgi_past_deadline_is_killed() {
    let root = fixture("cgi-deadline");
    let addr = start_with(&root, 10, "{ client: 5, cgi: 1, max: 60 }");
    let (mut stream, mut reader) = connect(addr);

    let started = Instant::now();
    stream
        .write_all(b"GET /cgi/hang.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 502);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_reaped(&root);

    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut reader, false).status, 200);
}

#[test]
fn test_connection_lifetime_ends_pending_cgi() {
    let root = fixture("lifetime-cgi");
    let addr = start_with(&root, 10, "{ client: 30, cgi: 30, max: 2 }");
    let (mut stream, mut reader) = connect(addr);

    let started = Instant::now();
    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut reader, false).status, 200);

    stream
        .write_all(b"GET /cgi/hang.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 502);
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_closed(&mut reader);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_reaped(&root);
}

#[test]
fn test_connection_lifetime_closes_idle_client() {
    let root = fixture("lifetime-idle");
    let addr = start_with(&root, 10, "{ client: 30, cgi: 30, max: 1 }");
    let (mut stream, mut reader) = connect(addr);

    let started = Instant::now();
    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    assert_eq!(read_reply(&mut reader, false).status, 200);
    assert_closed(&mut reader);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_basic_auth_gate() {
    let root = fixture("auth");
    let addr = start(&root, 10);

    let (mut stream, mut reader) = connect(addr);
    stream
        .write_all(b"GET /private/ HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 401);
    assert!(reply.header("WWW-Authenticate").unwrap().contains("realm=\"staff\""));
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_closed(&mut reader);

    let (mut stream, mut reader) = connect(addr);
    stream
        .write_all(
            b"GET /private/ HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n",
        )
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "members only");
}

#[test]
fn test_declared_body_over_limit_is_413() {
    let root = fixture("limit");
    let addr = start(&root, 10);
    let (mut stream, mut reader) = connect(addr);

    stream
        .write_all(b"PUT /upload/big.bin HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4194304\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut reader, false);
    assert_eq!(reply.status, 413);
    assert_eq!(reply.header("Connection"), Some("close"));
    assert_closed(&mut reader);
    assert!(!root.join("upload/big.bin").exists());
}
