//! Puffin CLI: message bus to raw archive and typed Parquet.

use std::process::ExitCode;

use puffin::{Application, Config};

fn main() -> ExitCode {
    Application::<Config>::run()
}
