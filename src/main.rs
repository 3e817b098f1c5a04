fn main() -> anyhow::Result<()> {
    delivery_dashboard_lib::run()
}
