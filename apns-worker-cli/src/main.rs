use std::process::ExitCode;

fn main() -> ExitCode {
    match apns_worker_cli::main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
