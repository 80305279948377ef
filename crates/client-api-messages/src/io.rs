//! Framed packet transport.
//!
//! Packets are 8-byte aligned on the wire; the header's byte count is the
//! unpadded size. The async pair drives instance connections; the blocking
//! pair serves the control socket, where OPEN_INSTANCE hands a file
//! descriptor across with `SCM_RIGHTS`.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use stampdb_primitives::align8;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{Endian, FrameError, FrameHead, FRAME_HEAD_LEN};
use crate::msg::Msg;

/// Read one packet. `Ok(None)` on clean EOF at a packet boundary.
pub async fn read_msg<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Msg>, FrameError> {
    let mut head_buf = [0u8; FRAME_HEAD_LEN];
    match r.read_exact(&mut head_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let head = FrameHead::decode(&head_buf)?;
    let wire_len = align8(head.bytes as usize);
    let mut payload = vec![0u8; wire_len - FRAME_HEAD_LEN];
    r.read_exact(&mut payload).await.map_err(FrameError::Io)?;
    payload.truncate(head.bytes as usize - FRAME_HEAD_LEN);
    Msg::decode(&head, &payload).map(Some)
}

/// Write one packet in the given byte order.
pub async fn write_msg<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &Msg,
    endian: Endian,
) -> io::Result<()> {
    w.write_all(&msg.encode(endian)).await
}

/// Blocking variant of [`read_msg`] for the control socket.
pub fn read_msg_sync<R: Read>(r: &mut R) -> Result<Option<Msg>, FrameError> {
    let mut head_buf = [0u8; FRAME_HEAD_LEN];
    match r.read_exact(&mut head_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let head = FrameHead::decode(&head_buf)?;
    let wire_len = align8(head.bytes as usize);
    let mut payload = vec![0u8; wire_len - FRAME_HEAD_LEN];
    r.read_exact(&mut payload).map_err(FrameError::Io)?;
    payload.truncate(head.bytes as usize - FRAME_HEAD_LEN);
    Msg::decode(&head, &payload).map(Some)
}

/// Blocking variant of [`write_msg`].
pub fn write_msg_sync<W: Write>(w: &mut W, msg: &Msg, endian: Endian) -> io::Result<()> {
    w.write_all(&msg.encode(endian))?;
    w.flush()
}

/// Send `msg` over the control socket, attaching `fd` as ancillary data.
pub fn send_msg_with_fd(
    sock: &UnixStream,
    msg: &Msg,
    endian: Endian,
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<()> {
    let wire = msg.encode(endian);
    let iov = [IoSlice::new(&wire)];
    let raw: [RawFd; 1];
    let cmsgs: &[ControlMessage] = match &fd {
        Some(fd) => {
            raw = [fd.as_raw_fd()];
            &[ControlMessage::ScmRights(&raw)]
        }
        None => &[],
    };
    let n = sendmsg::<()>(sock.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
        .map_err(io::Error::from)?;
    if n != wire.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short control-socket send",
        ));
    }
    Ok(())
}

/// Receive one packet from the control socket, plus any passed descriptor.
///
/// Control packets are small and sent in one shot, so a partial read here
/// means the peer is broken.
pub fn recv_msg_with_fd(sock: &UnixStream) -> Result<Option<(Msg, Option<OwnedFd>)>, FrameError> {
    let mut buf = [0u8; 512];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut buf)];

    let (n, fd) = {
        let recv = recvmsg::<()>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;
        let mut fd = None;
        for cmsg in recv.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&raw) = fds.first() {
                    // SAFETY: the kernel just handed us ownership of this fd.
                    fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        (recv.bytes, fd)
    };
    if n == 0 {
        return Ok(None);
    }
    if n < FRAME_HEAD_LEN {
        return Err(FrameError::Short);
    }
    let head = FrameHead::decode(&buf[..FRAME_HEAD_LEN].try_into().unwrap())?;
    if n < head.bytes as usize {
        return Err(FrameError::Short);
    }
    let payload = &buf[FRAME_HEAD_LEN..head.bytes as usize];
    Msg::decode(&head, payload).map(|m| Some((m, fd)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Begin, Body};
    use stampdb_primitives::DbStamp;

    #[tokio::test]
    async fn async_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Msg::new(Body::Begin(Begin {
            freeze_ts: DbStamp::new(0xbeef),
        }));
        write_msg(&mut a, &msg, Endian::Big).await.unwrap();
        write_msg(&mut a, &Msg::new(Body::Continue), Endian::Little)
            .await
            .unwrap();
        drop(a);

        assert_eq!(read_msg(&mut b).await.unwrap(), Some(msg));
        assert_eq!(
            read_msg(&mut b).await.unwrap(),
            Some(Msg::new(Body::Continue))
        );
        assert_eq!(read_msg(&mut b).await.unwrap(), None);
    }

    #[test]
    fn fd_passing_over_socketpair() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let (extra_a, extra_b) = UnixStream::pair().unwrap();

        let msg = Msg::new(Body::OpenInstance);
        send_msg_with_fd(
            &tx,
            &msg,
            Endian::NATIVE,
            Some(std::os::fd::AsFd::as_fd(&extra_a)),
        )
        .unwrap();

        let (got, fd) = recv_msg_with_fd(&rx).unwrap().unwrap();
        assert_eq!(got, msg);
        let fd = fd.expect("descriptor must arrive");

        // prove the descriptor is live: write through it, read on the peer
        let passed = UnixStream::from(fd);
        (&passed).write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        (&extra_b).read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
