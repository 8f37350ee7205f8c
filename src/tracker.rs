//! Tracker announce clients: HTTP (`tracker::http`) and UDP/BEP 15
//! (`tracker::udp`), each a non-blocking `Command`.

pub mod http;
pub mod udp;
