fn main() -> anyhow::Result<()> {
    aglauncher::main()
}
