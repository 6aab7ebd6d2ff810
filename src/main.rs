use campus_hub::app::{self, Action};

fn main() {
    let action = match app::parse_args(std::env::args().skip(1)) {
        Ok(action) => action,
        Err(err) => {
            eprintln!("error: {err}\n\n{}", app::HELP);
            std::process::exit(2);
        }
    };

    match action {
        Action::Version => println!("Campus Hub {}", campus_hub::VERSION),
        Action::Help => println!("{}", app::HELP),
        Action::Run(invocation) => {
            if let Err(err) = campus_hub::run(invocation) {
                eprintln!("error: {err:?}");
                std::process::exit(1);
            }
        }
    }
}
