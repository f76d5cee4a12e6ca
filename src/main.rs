use clap::{crate_version, App, Arg};
use rtmp_relay::{Config, Relay};

fn main() {
    env_logger::init();

    let matches = App::new("rtmp-relay")
        .version(crate_version!())
        .arg(Arg::with_name("config").required(true).index(1))
        .get_matches();
    let path = matches.value_of("config").expect("missing config path");

    if let Err(err) = run(path) {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(path: &str) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let mut relay = Relay::new(&config)?;
    relay.run()
}
