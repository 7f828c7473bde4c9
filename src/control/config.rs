use std::net::SocketAddr;

#[derive(Debug)]
pub struct ControlConfig {
    /// The address that the control socket is bound to. A wildcard address (v4 or v6) makes
    ///  the listener bind a second socket on the same port for the other address family,
    ///  since not every platform reaches both families through a single wildcard socket.
    pub listen_addr: SocketAddr,
}

impl ControlConfig {
    pub fn new(listen_addr: SocketAddr) -> ControlConfig {
        ControlConfig {
            listen_addr,
        }
    }
}
