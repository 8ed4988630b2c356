use std::io;
use std::net::{Ipv4Addr, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;

/// A sink for complete frames.
///
/// Each call to [`send`](Self::send) transmits one datagram. Errors are reported to the caller but
/// never retried.
pub trait Transport: Send {
    /// Sends a single frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).send(frame)
    }
}

/// Forwards frames into a channel.
///
/// Useful to capture the emitted frames in tests or to hand them to a custom sender thread.
impl Transport for crossbeam_channel::Sender<Vec<u8>> {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        crossbeam_channel::Sender::send(self, frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame receiver disconnected"))
    }
}

/// A connected, non-blocking datagram socket.
#[derive(Debug)]
pub enum Remote {
    /// A UDP socket.
    Udp(UdpSocket),
    /// A Unix datagram socket.
    #[cfg(unix)]
    UnixDatagram(UnixDatagram),
}

impl Remote {
    /// Connects to the given address.
    ///
    /// The address is either a fully-qualified URL where the scheme identifies the transport
    /// (`udp://127.0.0.1:8125` or `unixgram:///var/run/datadog/dsd.socket`), or a plain
    /// `host:port`, which uses UDP.
    pub fn connect(addr: &str) -> io::Result<Self> {
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                "udp" => Self::connect_udp(path),
                #[cfg(unix)]
                "unixgram" => {
                    let socket = UnixDatagram::unbound()?;
                    socket.connect(path)?;
                    socket.set_nonblocking(true)?;

                    Ok(Self::UnixDatagram(socket))
                }
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid scheme '{scheme}', expected one of 'udp', 'unixgram'"),
                )),
            };
        }

        Self::connect_udp(addr)
    }

    fn connect_udp(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self::Udp(socket))
    }
}

impl Transport for Remote {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(socket) => socket.send(frame).map(drop),
            #[cfg(unix)]
            Self::UnixDatagram(socket) => socket.send(frame).map(drop),
        }
    }
}
