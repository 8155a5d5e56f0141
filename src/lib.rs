//! capsift analyses recorded network captures: traffic statistics, protocol
//! breakdowns, top talkers and heuristic attack detection, offline and from
//! untrusted input.
pub mod analyser;
pub mod ui;
