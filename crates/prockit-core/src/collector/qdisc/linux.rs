//! `NETLINK_ROUTE` transport for the qdisc collector.

use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::{debug, warn};

use super::{QdiscSource, TCMSG_LEN};
use crate::error::{ProcfsError, Result};

const NLMSG_HDR_LEN: usize = 16;
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWQDISC: u16 = 36;
const RTM_GETQDISC: u16 = 38;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_DUMP: u16 = 0x300;

// Not exported by every libc target.
const SOL_NETLINK: libc::c_int = 270;
const NETLINK_GET_STRICT_CHK: libc::c_int = 12;

const RECV_BUF_SIZE: usize = 64 * 1024;

fn netlink_err(op: &'static str) -> ProcfsError {
    ProcfsError::Netlink {
        op,
        source: io::Error::last_os_error(),
    }
}

fn truncated(len: usize) -> ProcfsError {
    ProcfsError::Netlink {
        op: "recv",
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            format!("truncated netlink message, len={}", len),
        ),
    }
}

/// Dumps qdiscs over a netlink socket opened at first use.
#[derive(Debug, Default)]
pub struct NetlinkQdiscSource {
    sock: Option<OwnedFd>,
    seq: u32,
    buf: Vec<u8>,
}

impl NetlinkQdiscSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn open() -> Result<OwnedFd> {
        // SAFETY: plain syscall, the returned descriptor is checked before use.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(netlink_err("socket"));
        }
        // SAFETY: fd is a freshly opened descriptor owned by nobody else.
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: sockaddr_nl is plain old data, all zeroes is valid.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: addr outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(netlink_err("bind"));
        }

        let on: libc::c_int = 1;
        // SAFETY: on outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                SOL_NETLINK,
                NETLINK_GET_STRICT_CHK,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOPROTOOPT) {
                return Err(ProcfsError::Netlink {
                    op: "setsockopt",
                    source: err,
                });
            }
            debug!("netlink: strict checking not supported by this kernel");
        }
        Ok(sock)
    }

    fn socket(&mut self) -> Result<libc::c_int> {
        if self.sock.is_none() {
            self.sock = Some(Self::open()?);
        }
        Ok(self.sock.as_ref().map_or(-1, |s| s.as_raw_fd()))
    }

    fn send_request(&mut self, fd: libc::c_int) -> Result<u32> {
        self.seq = self.seq.wrapping_add(1);
        let len = (NLMSG_HDR_LEN + TCMSG_LEN) as u32;
        let mut req = Vec::with_capacity(len as usize);
        req.extend_from_slice(&len.to_ne_bytes());
        req.extend_from_slice(&RTM_GETQDISC.to_ne_bytes());
        req.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
        req.extend_from_slice(&self.seq.to_ne_bytes());
        req.extend_from_slice(&0u32.to_ne_bytes());
        req.resize(len as usize, 0);

        // SAFETY: req outlives the call and the length is its own.
        let n = unsafe { libc::send(fd, req.as_ptr() as *const libc::c_void, req.len(), 0) };
        if n < 0 {
            return Err(netlink_err("send"));
        }
        Ok(self.seq)
    }

    fn recv(&mut self, fd: libc::c_int) -> Result<usize> {
        self.buf.resize(RECV_BUF_SIZE, 0);
        loop {
            // SAFETY: buf is RECV_BUF_SIZE long and exclusively borrowed.
            let n = unsafe {
                libc::recv(
                    fd,
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ProcfsError::Netlink {
                    op: "recv",
                    source: err,
                });
            }
        }
    }

    fn dump_inner(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let fd = self.socket()?;
        let seq = self.send_request(fd)?;
        loop {
            let n = self.recv(fd)?;
            let mut msgs = &self.buf[..n];
            while msgs.len() >= NLMSG_HDR_LEN {
                let len = u32::from_ne_bytes([msgs[0], msgs[1], msgs[2], msgs[3]]) as usize;
                if len < NLMSG_HDR_LEN || len > msgs.len() {
                    return Err(truncated(len));
                }
                let typ = u16::from_ne_bytes([msgs[4], msgs[5]]);
                let msg_seq = u32::from_ne_bytes([msgs[8], msgs[9], msgs[10], msgs[11]]);
                let payload = &msgs[NLMSG_HDR_LEN..len];
                msgs = msgs.get((len + 3) & !3..).unwrap_or_default();

                if msg_seq != seq {
                    continue;
                }
                match typ {
                    NLMSG_DONE => return Ok(()),
                    NLMSG_NOOP => {}
                    NLMSG_ERROR => {
                        let code = payload
                            .get(..4)
                            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                            .ok_or_else(|| truncated(payload.len()))?;
                        if code < 0 {
                            return Err(ProcfsError::Netlink {
                                op: "dump",
                                source: io::Error::from_raw_os_error(-code),
                            });
                        }
                    }
                    RTM_NEWQDISC => f(payload)?,
                    _ => {}
                }
            }
        }
    }
}

impl QdiscSource for NetlinkQdiscSource {
    fn dump(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let result = self.dump_inner(f);
        if result.is_err() {
            // Unread replies would be taken for the next dump's.
            if self.sock.take().is_some() {
                warn!("netlink: qdisc dump failed, socket reset");
            }
        }
        result
    }

    fn interface_names(&mut self, into: &mut HashMap<u32, String>) -> Result<()> {
        // SAFETY: the array is terminated by a zero index and released below.
        let list = unsafe { libc::if_nameindex() };
        if list.is_null() {
            return Err(netlink_err("if_nameindex"));
        }
        let mut entry = list;
        // SAFETY: entries are read up to the terminator, names are valid C
        // strings until if_freenameindex.
        unsafe {
            while (*entry).if_index != 0 {
                let name = CStr::from_ptr((*entry).if_name).to_string_lossy().into_owned();
                into.insert((*entry).if_index, name);
                entry = entry.add(1);
            }
            libc::if_freenameindex(list);
        }
        Ok(())
    }
}
