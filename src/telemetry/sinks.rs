//! Remote sinks
//!
//! A relational sink takes one row per insert; a file-server sink takes the
//! whole durable log at once. Both are traits so the pipeline can be tested
//! with in-memory doubles.

use crate::error::{FieldgateError, Result};
use async_trait::async_trait;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Row-oriented remote store
#[async_trait]
pub trait RelationalSink: Send + Sync {
    /// Insert one row. `None` is stored as SQL NULL.
    async fn insert_row(&self, columns: &[String], values: &[Option<String>]) -> Result<()>;

    /// Keep only the newest `row_limit` rows
    async fn prune(&self, row_limit: u64) -> Result<()>;

    fn describe(&self) -> String;
}

/// Whole-file remote store
#[async_trait]
pub trait FileServerSink: Send + Sync {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()>;

    fn describe(&self) -> String;
}

/// Relational sink over any sqlx driver (MySQL in the field)
pub struct SqlSink {
    pool: AnyPool,
    table: String,
    target: String,
}

impl SqlSink {
    /// Create the pool without connecting; the first insert opens a connection
    pub fn connect_lazy(url: &str, table: &str, acquire_timeout: Duration) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            target: redact_url(url),
        })
    }

    /// Use an existing pool
    pub fn with_pool(pool: AnyPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            target: "pool".to_string(),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

/// Backtick-quoted identifier
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Parameterized insert for the given columns
pub fn insert_statement(table: &str, columns: &[String]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let placeholders = vec!["?"; columns.len()].join(",");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        names.join(","),
        placeholders
    )
}

/// Delete everything but the newest rows by `id`
pub fn prune_statement(table: &str) -> String {
    let table = quote_identifier(table);
    format!(
        "DELETE FROM {table} WHERE `id` NOT IN (SELECT `id` FROM (SELECT `id` FROM {table} ORDER BY `id` DESC LIMIT ?) AS newest)"
    )
}

/// Strip credentials from a connection URL for logging
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl RelationalSink for SqlSink {
    async fn insert_row(&self, columns: &[String], values: &[Option<String>]) -> Result<()> {
        if columns.len() != values.len() {
            return Err(FieldgateError::delivery(format!(
                "row has {} fields for {} columns",
                values.len(),
                columns.len()
            )));
        }
        let sql = insert_statement(&self.table, columns);
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value.clone());
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn prune(&self, row_limit: u64) -> Result<()> {
        let limit = i64::try_from(row_limit).unwrap_or(i64::MAX);
        sqlx::query(&prune_statement(&self.table))
            .bind(limit)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sql {} table {}", self.target, self.table)
    }
}

/// File server mounted into the local filesystem (NFS, SMB, sshfs)
pub struct DirectorySink {
    remote_dir: PathBuf,
}

impl DirectorySink {
    pub fn new<P: Into<PathBuf>>(remote_dir: P) -> Self {
        Self {
            remote_dir: remote_dir.into(),
        }
    }
}

#[async_trait]
impl FileServerSink for DirectorySink {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let fail = |what: &str, e: std::io::Error| {
            FieldgateError::file_server(format!(
                "{} {}: {}",
                what,
                self.remote_dir.display(),
                e
            ))
        };
        tokio::fs::create_dir_all(&self.remote_dir)
            .await
            .map_err(|e| fail("cannot create", e))?;

        // Copy under a hidden name, then rename into place
        let partial = self.remote_dir.join(format!(".{}.part", remote_name));
        let target = self.remote_dir.join(remote_name);
        tokio::fs::copy(local_path, &partial)
            .await
            .map_err(|e| fail("cannot copy into", e))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| fail("cannot rename in", e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("directory {}", self.remote_dir.display())
    }
}

/// FTP server, passive mode, binary transfers.
///
/// The file is stored under a hidden `.part` name and renamed into place
/// once the transfer has completed.
pub struct FtpSink {
    host: String,
    port: u16,
    user: String,
    password: String,
    remote_dir: String,
}

impl FtpSink {
    pub fn new(host: &str, port: u16, user: &str, password: &str, remote_dir: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            remote_dir: remote_dir.to_string(),
        }
    }

    fn remote_path(&self, name: &str) -> String {
        let dir = self.remote_dir.trim_end_matches('/');
        if dir.is_empty() && !self.remote_dir.starts_with('/') {
            name.to_string()
        } else {
            format!("{}/{}", dir, name)
        }
    }
}

#[async_trait]
impl FileServerSink for FtpSink {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let mut control = FtpControl::connect(&self.host, self.port).await?;
        let code = control
            .command(&format!("USER {}", self.user), &[230, 331])
            .await?;
        if code == 331 {
            control
                .command(&format!("PASS {}", self.password), &[230, 202])
                .await?;
        }
        control.command("TYPE I", &[200]).await?;

        let partial = self.remote_path(&format!(".{}.part", remote_name));
        let target = self.remote_path(remote_name);

        let mut data = control.passive().await?;
        control
            .command(&format!("STOR {}", partial), &[125, 150])
            .await?;
        let mut file = tokio::fs::File::open(local_path).await?;
        tokio::io::copy(&mut file, &mut data).await?;
        data.shutdown().await?;
        drop(data);
        control.expect(&[226, 250]).await?;

        control
            .command(&format!("RNFR {}", partial), &[350])
            .await?;
        control.command(&format!("RNTO {}", target), &[250]).await?;
        // The upload is complete; a failed goodbye changes nothing
        let _ = control.command("QUIT", &[221]).await;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "ftp {}@{}:{} {}",
            self.user, self.host, self.port, self.remote_dir
        )
    }
}

/// Control connection of one FTP session
struct FtpControl {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: IpAddr,
}

impl FtpControl {
    async fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            FieldgateError::file_server(format!("cannot connect to {}:{}: {}", host, port, e))
        })?;
        let peer = stream.peer_addr()?.ip();
        let (read, writer) = stream.into_split();
        let mut control = Self {
            reader: BufReader::new(read),
            writer,
            peer,
        };
        control.expect(&[220]).await?;
        Ok(control)
    }

    /// Next complete reply, folding multi-line replies into their last line
    async fn reply(&mut self) -> Result<(u16, String)> {
        let first = self.read_line().await?;
        let code = reply_code(&first)?;
        if first.as_bytes().get(3) != Some(&b'-') {
            return Ok((code, first));
        }
        let last = format!("{} ", code);
        loop {
            let line = self.read_line().await?;
            if line.starts_with(&last) {
                return Ok((code, line));
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(FieldgateError::file_server("FTP server closed the connection"));
        }
        Ok(line.trim_end().to_string())
    }

    async fn expect(&mut self, accepted: &[u16]) -> Result<(u16, String)> {
        let (code, text) = self.reply().await?;
        if accepted.contains(&code) {
            Ok((code, text))
        } else {
            Err(FieldgateError::file_server(format!("FTP server replied '{}'", text)))
        }
    }

    async fn command(&mut self, line: &str, accepted: &[u16]) -> Result<u16> {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        Ok(self.expect(accepted).await?.0)
    }

    /// Open the data connection for the next transfer. The address in the
    /// reply is ignored; servers behind NAT often report a private one.
    async fn passive(&mut self) -> Result<TcpStream> {
        self.writer.write_all(b"PASV\r\n").await?;
        let (_, text) = self.expect(&[227]).await?;
        let port = parse_pasv_port(&text)?;
        TcpStream::connect((self.peer, port)).await.map_err(|e| {
            FieldgateError::file_server(format!("cannot open data connection: {}", e))
        })
    }
}

fn reply_code(line: &str) -> Result<u16> {
    line.get(..3)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| FieldgateError::file_server(format!("malformed FTP reply '{}'", line)))
}

/// Data port of a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply
pub fn parse_pasv_port(reply: &str) -> Result<u16> {
    let malformed = || FieldgateError::file_server(format!("malformed PASV reply '{}'", reply));
    let inner = reply
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inside, _)| inside)
        .ok_or_else(malformed)?;
    let fields = inner
        .split(',')
        .map(|f| f.trim().parse::<u8>())
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| malformed())?;
    match fields.as_slice() {
        [_, _, _, _, hi, lo] => Ok((u16::from(*hi) << 8) | u16::from(*lo)),
        _ => Err(malformed()),
    }
}
