fn main() {
    despan::cli::run();
}
