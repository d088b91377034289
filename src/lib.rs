/// Builds a [`mr::worker::KeyValue`] from anything convertible into strings.
#[macro_export]
macro_rules! new_kv {
    ($key:expr, $val:expr) => {
        $crate::mr::worker::KeyValue::new($key, $val)
    };
}

pub mod mr;
pub mod mrapps;
pub mod util;
