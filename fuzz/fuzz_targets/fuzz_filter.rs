//! Fuzz target for resource filters.
//!
//! Arbitrary exclude patterns either compile or are rejected as config
//! errors; matching arbitrary external ids never panics.

#![no_main]

use catalog_replicator::config::FilterConfig;
use catalog_replicator::entity::ResourceType;
use catalog_replicator::filter::ResourceFilter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (pattern, external_id) = data;
    let config = FilterConfig {
        exclude_pattern: Some(pattern.to_string()),
        external_ids: None,
    };

    if let Ok(filter) = ResourceFilter::new(ResourceType::Event, &config) {
        let _ = filter.admits(external_id);
    }
});
