// MIT License
// Copyright 2023--present exttool developers

fn main() {
    std::process::exit(exttool_cli::standalone::run(std::env::args().skip(1)));
}
