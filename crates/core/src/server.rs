//! The client rendezvous socket.
//!
//! Clients connect to `.crd_socket` inside the database directory. The
//! control connection answers HELLO with the database's stamps and block
//! size; OPEN_INSTANCE creates a socketpair, hands one end to the client
//! via SCM_RIGHTS, and serves the other end from a dedicated instance
//! task.

use std::io::{self, IoSlice};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::PathBuf;

use log::{info, warn};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use stampdb_client_api_messages as proto;
use stampdb_client_api_messages::{Body, Endian, Msg};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};

use crate::config::EngineOptions;
use crate::db::Db;
use crate::error::{DBError, Result};
use crate::instance::Instance;

pub const CONTROL_SOCKET: &str = ".crd_socket";

pub struct Server {
    dir: PathBuf,
    opts: EngineOptions,
}

impl Server {
    pub fn new(dir: impl Into<PathBuf>, opts: EngineOptions) -> Server {
        Server {
            dir: dir.into(),
            opts,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(CONTROL_SOCKET)
    }

    /// Accept control connections until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        // make sure the database opens before anyone connects
        drop(Db::open(&self.dir, self.opts.clone(), true)?);

        let path = self.socket_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        info!("listening on {}", path.display());

        loop {
            let (stream, _) = listener.accept().await?;
            let dir = self.dir.clone();
            let opts = self.opts.clone();
            tokio::spawn(async move {
                if let Err(e) = control_conn(stream, dir, opts).await {
                    warn!("control connection failed: {e}");
                }
            });
        }
    }
}

async fn control_conn(mut stream: UnixStream, dir: PathBuf, opts: EngineOptions) -> Result<()> {
    let mut db = Db::open(&dir, opts.clone(), false)?;

    loop {
        let msg = match proto::read_msg(&mut stream).await? {
            Some(msg) => msg,
            None => return Ok(()),
        };
        match msg.body {
            Body::Hello(_) => {
                let reply = Msg::new(Body::Hello(proto::Hello {
                    sync_ts: db.sync_ts(),
                    min_cts: db.min_cts_hint(),
                    block_size: db.block_size(),
                    dbname: String::new(),
                }));
                proto::write_msg(&mut stream, &reply, Endian::NATIVE).await?;
            }
            Body::OpenInstance => {
                let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
                ours.set_nonblocking(true)?;
                let inst_stream = UnixStream::from_std(ours)?;
                let inst_db = Db::open(&dir, opts.clone(), false)?;
                tokio::spawn(async move {
                    if let Err(e) = Instance::new(inst_db, inst_stream).run().await {
                        warn!("instance failed: {e}");
                    }
                });
                let reply = Msg::new(Body::OpenInstance);
                send_with_fd(&stream, &reply, theirs.as_fd()).await?;
            }
            Body::CloseInstance => {
                let reply = Msg::new(Body::CloseInstance);
                proto::write_msg(&mut stream, &reply, Endian::NATIVE).await?;
                return Ok(());
            }
            Body::UpdateStampId(ts) => {
                db.set_stamp_id(ts.id());
                let reply = Msg::new(Body::UpdateStampId(ts));
                proto::write_msg(&mut stream, &reply, Endian::NATIVE).await?;
            }
            Body::SyncStamp(ts) | Body::UpdateSyncTs(ts) => {
                let error = db.update_sync_ts(ts).map(|_| 0).unwrap_or(-1);
                let reply = Msg::with_error(Body::UpdateSyncTs(ts), error);
                proto::write_msg(&mut stream, &reply, Endian::NATIVE).await?;
            }
            other => {
                let reply = Msg::with_error(other, -2);
                proto::write_msg(&mut stream, &reply, Endian::NATIVE).await?;
            }
        }
    }
}

/// Write `msg` on the control socket with `fd` attached as SCM_RIGHTS
/// ancillary data.
async fn send_with_fd(stream: &UnixStream, msg: &Msg, fd: BorrowedFd<'_>) -> Result<()> {
    let wire = msg.encode(Endian::NATIVE);
    loop {
        stream.writable().await?;
        let sent = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&wire)];
            let raw = [fd.as_raw_fd()];
            let cmsgs = [ControlMessage::ScmRights(&raw)];
            sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        });
        match sent {
            Ok(n) if n == wire.len() => return Ok(()),
            Ok(_) => return Err(DBError::LostLink),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
