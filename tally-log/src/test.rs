use tracing_subscriber::EnvFilter;

use crate::crates::CRATE_NAMES;

#[doc(hidden)]
pub fn __init_test(module_path: &'static str) {
    let crate_name = module_path.split("::").next().unwrap_or(module_path);

    let mut filter = EnvFilter::new("info").add_directive(
        format!("{crate_name}=trace")
            .parse()
            .expect("valid crate directive"),
    );

    for name in CRATE_NAMES {
        filter = filter.add_directive(format!("{name}=trace").parse().expect("valid directive"));
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

/// Initialize the logger for testing.
///
/// This logs to the stdout registered by the Rust test runner, and captures all logs from the
/// calling crate and the other tally crates.
///
/// # Example
///
/// ```
/// tally_log::init_test!();
/// ```
#[macro_export]
macro_rules! init_test {
    () => {
        $crate::__init_test(::std::module_path!());
    };
}
