//! Word count packaged as a loadable plugin for `mrworker`.

use mapreduce_ft::mr::worker::KeyValue;
use mapreduce_ft::mrapps::wc;

#[no_mangle]
pub fn map(filename: &str, contents: &str) -> Vec<KeyValue> {
    wc::map(filename, contents)
}

#[no_mangle]
pub fn reduce(key: &str, values: &[String]) -> String {
    wc::reduce(key, values)
}
