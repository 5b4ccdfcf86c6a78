fn main() -> std::process::ExitCode {
    opsdesk_cli::run()
}
