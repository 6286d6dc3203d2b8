//! TCP-backed [`tsb::transport::Transport`] implementation, built on the
//! `mio`-based [`tcp::TcpConnector`]/[`tcp::TcpStream`] substrate.
//!
//! Exists so the timeslice-building core can be exercised and tested without
//! an RDMA-capable NIC: every `Transport` semantic — one-sided writes,
//! tagged sends, polled completions — is carried over a plain framed TCP
//! byte stream instead of real remote memory.

pub mod tcp;
pub mod transport;

pub use transport::TcpTransport;
