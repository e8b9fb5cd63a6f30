//! Operational reports: the host reporter hook plus a mirror on the event bus.

use core_runtime::config::SharedSettings;
use core_runtime::events::{CacheEvent, EventBus, ReportEvent};
use core_runtime::hooks::{ReportExtra, ReportLabel};
use tracing::debug;

pub(crate) fn report(
    settings: &SharedSettings,
    events: &EventBus,
    label: ReportLabel,
    resource_id: &str,
    extra: ReportExtra,
) {
    debug!(label = %label, resource_id, ?extra, "Report");
    settings.report(label, resource_id, &extra);
    events
        .emit(CacheEvent::Report(ReportEvent {
            label,
            resource_id: resource_id.to_string(),
            extra,
        }))
        .ok();
}

/// Build a [`ReportExtra`] from `key => value` pairs.
macro_rules! extra {
    ($($k:expr => $v:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = core_runtime::hooks::ReportExtra::new();
        $( map.insert($k.to_string(), $v.to_string()); )*
        map
    }};
}

pub(crate) use extra;
