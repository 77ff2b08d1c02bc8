use std::path::Path;

use rulepay_core::signature::{sign, SIGNATURE_HEADER};
use secrecy::ExposeSecret;

use crate::commands::{load_config, read_input, CommandResult};

/// Signs the file's exact bytes, so the printed value only matches a request
/// whose body is byte-identical to the file.
pub fn run(path: &Path) -> CommandResult {
    let config = match load_config("sign") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let Some(secret) = config.scheduler.signing_secret else {
        return CommandResult::failure(
            "sign",
            "config_validation",
            "scheduler.signing_secret is not configured",
            2,
        );
    };
    let body = match read_input("sign", path) {
        Ok(body) => body,
        Err(failure) => return failure,
    };

    match sign(secret.expose_secret().as_bytes(), &body) {
        Ok(signature) => CommandResult::success("sign", format!("{SIGNATURE_HEADER}: {signature}")),
        Err(error) => CommandResult::failure("sign", "signature", error.to_string(), 1),
    }
}
