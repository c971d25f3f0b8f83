use super::PortReserver;
use crate::packet::Protocol;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::trace;

/// BPF `ret #0`：丢弃所有报文
#[cfg(any(target_os = "linux", target_os = "android"))]
const BPF_RET_K: u16 = 0x06;

/// 占位 socket，只用于占住端口号
///
/// 真正的流量通过抓包注入通道收发，内核投递给它的一切都被过滤器丢弃
#[derive(Debug)]
pub struct PortReservation {
    socket: Socket,
    port: u16,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

/// 通过绑定临时端口向内核预留端口
#[derive(Debug, Clone)]
pub struct OsPortReserver {
    bind: Ipv4Addr,
}

impl OsPortReserver {
    pub fn new(bind: Ipv4Addr) -> Self {
        Self { bind }
    }
}

impl Default for OsPortReserver {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn drop_everything(socket: &Socket) -> io::Result<()> {
    let program = [socket2::SockFilter::new(BPF_RET_K, 0, 0, 0)];
    socket.attach_filter(&program)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn drop_everything(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

impl PortReserver for OsPortReserver {
    type Guard = PortReservation;

    fn reserve(&self, protocol: Protocol) -> io::Result<(u16, PortReservation)> {
        let (ty, proto) = match protocol {
            Protocol::Tcp => (Type::STREAM, socket2::Protocol::TCP),
            Protocol::Udp => (Type::DGRAM, socket2::Protocol::UDP),
        };
        let socket = Socket::new(Domain::IPV4, ty, Some(proto))?;
        // 先挂过滤器再绑定，绑定后不会有报文排进队列
        drop_everything(&socket)?;
        socket.bind(&SocketAddrV4::new(self.bind, 0).into())?;
        if protocol == Protocol::Tcp {
            // 监听状态下内核不会对回包回复 RST，过滤器又让握手无法完成
            socket.listen(1)?;
        }

        let port = socket
            .local_addr()?
            .as_socket_ipv4()
            .map(|addr| addr.port())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bound to a non-IPv4 address"))?;
        trace!("OS reserved {} port {}", protocol, port);
        Ok((port, PortReservation { socket, port }))
    }
}
