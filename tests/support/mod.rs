pub mod server;

#[allow(unused)]
pub fn init_logger() {
    let _ = env_logger::try_init();
}
