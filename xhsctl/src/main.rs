use clap::Parser;

fn main() {
    let cli = xhsctl::Cli::parse();
    if let Err(err) = xhsctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
