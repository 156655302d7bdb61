//! Canonical default OT type identifier.
//!
//! The server declares its default operational-transform type during the
//! `init` handshake and the client refuses to connect unless it matches the
//! type it was configured with. The type registry itself lives outside this
//! crate; only the identifier is needed here.

/// URI of the canonical default OT type, compared against the
/// server-declared default at handshake.
pub const DEFAULT_TYPE_URI: &str = "http://sharejs.org/types/JSONv0";
