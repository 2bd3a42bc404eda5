pub mod agl;

pub fn main() -> anyhow::Result<()> {
    agl::cli::run()
}
