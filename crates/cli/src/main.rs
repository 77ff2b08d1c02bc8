use std::process::ExitCode;

fn main() -> ExitCode {
    rulepay_cli::run()
}
