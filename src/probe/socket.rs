use anyhow::{Result, anyhow};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::AsRawFd;

/// One received datagram.
#[derive(Debug, Clone, Copy)]
pub struct Datagram {
    pub len: usize,
    pub src: IpAddr,
    /// Kernel receive timestamp (SO_TIMESTAMPNS), when the socket provides
    /// one. Wall-clock nanoseconds.
    pub recv_time_ns: Option<i64>,
}

/// The narrow socket capability the engine drives. Hides raw-vs-DGRAM
/// sockets, the two address families, and kernel timestamping.
pub trait Transport {
    fn send_to(&mut self, packet: &[u8], dst: IpAddr) -> io::Result<usize>;

    /// Wait up to `wait_ns` for one datagram on any enabled socket. `None`
    /// means the wait timed out (transient read errors are folded into
    /// this as well; only setup errors are fatal).
    fn recv(&mut self, buf: &mut [u8], wait_ns: i64) -> Option<Datagram>;

    /// Raw IPv4 sockets deliver the IP header; DGRAM sockets do not.
    fn v4_includes_ip_header(&self) -> bool;
}

/// Socket options applied once at startup.
#[derive(Debug, Clone, Default)]
pub struct SocketConfig {
    pub ttl: Option<u32>,
    pub tos: Option<u32>,
    pub dont_fragment: bool,
    pub fwmark: Option<u32>,
    pub src_addr: Option<IpAddr>,
}

/// Blocking wait over the enabled ICMP sockets (one per address family).
pub struct SocketMux {
    v4: Option<Socket>,
    v6: Option<Socket>,
    raw4: bool,
}

fn create_icmp_socket(ipv6: bool, raw: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let protocol = if ipv6 {
        Protocol::ICMPV6
    } else {
        Protocol::ICMPV4
    };
    let ty = if raw { Type::RAW } else { Type::DGRAM };

    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_nonblocking(false)?;
    // Large receive buffer: many targets can answer within one interval
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    Ok(socket)
}

/// Open one family's socket, raw first, unprivileged ICMP as fallback.
fn open_family(ipv6: bool) -> io::Result<(Socket, bool)> {
    match create_icmp_socket(ipv6, true) {
        Ok(s) => Ok((s, true)),
        Err(raw_err) => match create_icmp_socket(ipv6, false) {
            Ok(s) => {
                eprintln!(
                    "reach: using unprivileged ICMP{} socket",
                    if ipv6 { "v6" } else { "" }
                );
                Ok((s, false))
            }
            Err(_) => Err(raw_err),
        },
    }
}

fn enable_rx_timestamps(socket: &Socket) {
    let fd = socket.as_raw_fd();
    let opt: libc::c_int = 1;
    let len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPNS,
            &opt as *const _ as *const libc::c_void,
            len,
        ) != 0
            && libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMP,
                &opt as *const _ as *const libc::c_void,
                len,
            ) != 0
        {
            eprintln!("reach: setting SO_TIMESTAMPNS and SO_TIMESTAMP option failed");
        }
    }
}

fn set_dont_fragment(socket: &Socket, ipv6: bool) {
    let fd = socket.as_raw_fd();
    let (level, name, value) = if ipv6 {
        (
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IPV6_PMTUDISC_DO,
        )
    } else {
        (
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DO,
        )
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if rc != 0 {
        eprintln!(
            "reach: setting don't-fragment: {}",
            io::Error::last_os_error()
        );
    }
}

fn apply_options(socket: &Socket, ipv6: bool, raw: bool, cfg: &SocketConfig) {
    if let Some(ttl) = cfg.ttl {
        let res = if ipv6 {
            socket.set_unicast_hops_v6(ttl)
        } else {
            socket.set_ttl(ttl)
        };
        if let Err(e) = res {
            eprintln!("reach: setting time to live: {}", e);
        }
    }

    if let Some(tos) = cfg.tos {
        let res = if ipv6 {
            socket.set_tclass_v6(tos)
        } else {
            socket.set_tos(tos)
        };
        if let Err(e) = res {
            eprintln!("reach: setting type of service: {}", e);
        }
    }

    if let Some(mark) = cfg.fwmark
        && let Err(e) = socket.set_mark(mark)
    {
        eprintln!("reach: setting fwmark: {}", e);
    }

    if cfg.dont_fragment {
        set_dont_fragment(socket, ipv6);
    }

    // DGRAM ICMP sockets take the echo id of outgoing requests from the
    // bound port; bind it to our identifier so reply correlation works
    // the same as on raw sockets.
    let port = if raw {
        0
    } else {
        crate::probe::icmp::get_identifier()
    };
    let src = match (cfg.src_addr, ipv6) {
        (Some(ip @ IpAddr::V4(_)), false) | (Some(ip @ IpAddr::V6(_)), true) => Some(ip),
        _ => None,
    };
    if src.is_some() || !raw {
        let ip = src.unwrap_or(if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        if let Err(e) = socket.bind(&SockAddr::from(SocketAddr::new(ip, port))) {
            eprintln!("reach: cannot bind {}: {}", ip, e);
        }
    }

    enable_rx_timestamps(socket);
}

impl SocketMux {
    /// Open sockets for the requested families. Succeeds if at least one
    /// requested family could be opened.
    pub fn open(need_v4: bool, need_v6: bool, cfg: &SocketConfig) -> Result<Self> {
        let mut mux = Self {
            v4: None,
            v6: None,
            raw4: false,
        };
        let mut last_err = None;

        if need_v4 {
            match open_family(false) {
                Ok((socket, raw)) => {
                    apply_options(&socket, false, raw, cfg);
                    mux.raw4 = raw;
                    mux.v4 = Some(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }
        if need_v6 {
            match open_family(true) {
                // for receiving it makes no difference whether the v6
                // socket is raw: the kernel strips the IPv6 header on both
                Ok((socket, raw)) => {
                    apply_options(&socket, true, raw, cfg);
                    mux.v6 = Some(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }

        if mux.v4.is_none() && mux.v6.is_none() {
            let err = last_err.unwrap_or_else(|| io::Error::other("no address family enabled"));
            return Err(anyhow!(
                "cannot create ICMP socket ({}) - requires root or CAP_NET_RAW,\n\
                 or net.ipv4.ping_group_range covering this user",
                err
            ));
        }
        Ok(mux)
    }

    /// Bind both sockets to a network interface. Failure here is fatal to
    /// the caller, unlike the other options.
    pub fn bind_device(&self, iface: &str) -> Result<()> {
        for socket in [self.v4.as_ref(), self.v6.as_ref()].into_iter().flatten() {
            socket
                .bind_device(Some(iface.as_bytes()))
                .map_err(|e| anyhow!("binding to interface {}: {}", iface, e))?;
        }
        Ok(())
    }

    /// Wait for readability on either socket. Returns the ready fd, or
    /// None on timeout. Interrupted waits are reissued.
    fn poll_ready(&self, wait_ns: i64) -> Option<i32> {
        let mut fds = [libc::pollfd {
            fd: -1,
            events: libc::POLLIN,
            revents: 0,
        }; 2];
        let mut n = 0;
        if let Some(s) = &self.v4 {
            fds[n].fd = s.as_raw_fd();
            n += 1;
        }
        if let Some(s) = &self.v6 {
            fds[n].fd = s.as_raw_fd();
            n += 1;
        }

        let timeout_ms = wait_ns_to_poll_ms(wait_ns);
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), n as libc::nfds_t, timeout_ms) };
            if rc < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                eprintln!("reach: poll: {}", e);
                return None;
            }
            if rc == 0 {
                return None;
            }
            return fds[..n]
                .iter()
                .find(|p| p.revents & libc::POLLIN != 0)
                .map(|p| p.fd);
        }
    }

    /// recvmsg with ancillary data so the kernel receive timestamp can be
    /// used as the RTT endpoint.
    fn recv_one(&self, fd: i32, buf: &mut [u8]) -> Option<Datagram> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len();

        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_TRUNC) };
        if n <= 0 {
            let e = io::Error::last_os_error();
            if n < 0 && e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::TimedOut
            {
                eprintln!("reach: recvmsg: {}", e);
            }
            return None;
        }

        let mut recv_time_ns = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPNS {
                    let ts: libc::timespec =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                    recv_time_ns = Some(ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64);
                } else if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMP
                {
                    let tv: libc::timeval =
                        std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const _);
                    recv_time_ns = Some(tv.tv_sec as i64 * 1_000_000_000 + tv.tv_usec as i64 * 1_000);
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        let src = sockaddr_to_ip(&storage)?;
        Some(Datagram {
            // MSG_TRUNC reports the full datagram length even when clipped
            len: (n as usize).min(buf.len()),
            src,
            recv_time_ns,
        })
    }
}

impl Transport for SocketMux {
    fn send_to(&mut self, packet: &[u8], dst: IpAddr) -> io::Result<usize> {
        let socket = match dst {
            IpAddr::V4(_) => self.v4.as_ref(),
            IpAddr::V6(_) => self.v6.as_ref(),
        };
        let Some(socket) = socket else {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        };
        socket.send_to(packet, &SockAddr::from(SocketAddr::new(dst, 0)))
    }

    fn recv(&mut self, buf: &mut [u8], wait_ns: i64) -> Option<Datagram> {
        let fd = self.poll_ready(wait_ns)?;
        self.recv_one(fd, buf)
    }

    fn v4_includes_ip_header(&self) -> bool {
        self.raw4
    }
}

fn wait_ns_to_poll_ms(wait_ns: i64) -> i32 {
    if wait_ns <= 0 {
        return 0;
    }
    // round up so we never wake before the deadline
    ((wait_ns + 999_999) / 1_000_000).min(i32::MAX as i64) as i32
}

fn sockaddr_to_ip(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                sin.sin_addr.s_addr,
            ))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}
