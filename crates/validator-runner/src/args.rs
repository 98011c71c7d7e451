use validator_protocol::{RunRequest, ValidatorCommand};

/// Builds `[command, url?, flags...]` for the script.
///
/// `--save` and `--page` are dropped for commands that do not understand them.
pub fn launch_args(command: ValidatorCommand, request: &RunRequest) -> Vec<String> {
    let mut args = vec![command.as_str().to_string()];
    if let Some(url) = request.target_url() {
        args.push(url.to_string());
    }
    if request.verbose {
        args.push("--verbose".to_string());
    }
    if request.save && command.supports_save() {
        args.push("--save".to_string());
    }
    if let Some(page) = request.page().filter(|_| command.supports_page()) {
        args.push("--page".to_string());
        args.push(page.to_string());
    }
    args
}
