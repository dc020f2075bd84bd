//! Freshet CLI: change feed to message bus.

use std::process::ExitCode;

use freshet::{Application, Config};

fn main() -> ExitCode {
    Application::<Config>::run()
}
