use fieldgate::telemetry::{FileServerSink, FtpSink};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Single-session FTP server that understands just enough for an upload
async fn serve_one(listener: TcpListener, files: Files, password: &'static str) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"220-test server\r\n220 ready\r\n").await.unwrap();

    let mut data_listener = None;
    let mut rename_from = None;
    while let Some(line) = lines.next_line().await.unwrap() {
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let reply = match verb {
            "USER" => "331 password please".to_string(),
            "PASS" if arg == password => "230 logged in".to_string(),
            "PASS" => "530 login incorrect".to_string(),
            "TYPE" => "200 binary".to_string(),
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                data_listener = Some(listener);
                // Deliberately unreachable address; the client must use the control peer
                format!(
                    "227 Entering Passive Mode (192,0,2,1,{},{})",
                    port >> 8,
                    port & 0xFF
                )
            }
            "STOR" => {
                write.write_all(b"150 go ahead\r\n").await.unwrap();
                let (mut data, _) = data_listener.take().unwrap().accept().await.unwrap();
                let mut body = Vec::new();
                data.read_to_end(&mut body).await.unwrap();
                files.lock().unwrap().insert(arg.to_string(), body);
                "226 stored".to_string()
            }
            "RNFR" => {
                rename_from = Some(arg.to_string());
                "350 ready for RNTO".to_string()
            }
            "RNTO" => {
                let from = rename_from.take().unwrap();
                let mut files = files.lock().unwrap();
                let body = files.remove(&from).unwrap();
                files.insert(arg.to_string(), body);
                "250 renamed".to_string()
            }
            "QUIT" => {
                write.write_all(b"221 bye\r\n").await.unwrap();
                return;
            }
            _ => "502 not implemented".to_string(),
        };
        write
            .write_all(format!("{}\r\n", reply).as_bytes())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn ftp_upload_stores_then_renames_into_place() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let files: Files = Arc::default();
    let server = tokio::spawn(serve_one(listener, Arc::clone(&files), "pw"));

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("ftp.csv");
    std::fs::write(&local, "DATE,TIME,SOC\n2024-05-01,08:00:00,55\n").unwrap();

    let sink = FtpSink::new("127.0.0.1", port, "site7", "pw", "/MicroHydro/SITE7/");
    sink.upload(&local, "ftp_20240501_080000.csv").await.unwrap();
    server.await.unwrap();

    let files = files.lock().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(
        files.get("/MicroHydro/SITE7/ftp_20240501_080000.csv").map(Vec::as_slice),
        Some(&b"DATE,TIME,SOC\n2024-05-01,08:00:00,55\n"[..])
    );
}

#[tokio::test]
async fn ftp_login_failure_is_a_file_server_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let files: Files = Arc::default();
    let server = tokio::spawn(serve_one(listener, Arc::clone(&files), "pw"));

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("ftp.csv");
    std::fs::write(&local, "DATE\n").unwrap();

    let sink = FtpSink::new("127.0.0.1", port, "site7", "wrong", "");
    let err = sink.upload(&local, "ftp.csv").await.unwrap_err();
    assert!(err.to_string().contains("530"));
    assert!(files.lock().unwrap().is_empty());
    server.abort();
}

#[tokio::test]
async fn ftp_unreachable_server_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("ftp.csv");
    std::fs::write(&local, "DATE\n").unwrap();

    let sink = FtpSink::new("127.0.0.1", port, "site7", "pw", "");
    let err = sink.upload(&local, "ftp.csv").await.unwrap_err();
    assert!(err.to_string().contains("cannot connect"));
}
