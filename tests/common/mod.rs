use std::path::Path;
use std::time::Duration;

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

#[allow(dead_code)]
pub fn cleanup(dir: &str) {
    let dir = std::path::Path::new(dir);
    if dir.exists() {
        std::fs::remove_dir_all(dir).unwrap();
    }
}

/// A config for `path` whose quotas never get in the way.
#[allow(dead_code)]
pub fn unlimited_config<P: AsRef<Path>>(path: P) -> authkv::Config {
    authkv::Config {
        buckets: 16,
        quota_up: usize::MAX,
        quota_down: usize::MAX,
        quota_req: usize::MAX,
        quota_duration: Duration::from_millis(50),
        ..authkv::Config::new(path)
    }
}
