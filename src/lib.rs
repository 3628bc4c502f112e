//! callflow: signal aggregation and composite scoring for token calls
//!
//! Everything lives under [`pipeline`]; the binaries in `src/bin/` wire it to
//! stdin, SQLite and the market-data adapter.

pub mod pipeline;
