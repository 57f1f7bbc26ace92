fn main() {
    docket_cli::init_tracing();
    let code = docket_cli::run_from_env();
    std::process::exit(code);
}
