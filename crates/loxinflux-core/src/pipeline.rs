// ── Record pipeline ──
//
// resolve → filter → format → deliver, in arrival order. Records already
// waiting in the queue are formatted together and handed to delivery as
// one batch.

use std::sync::Arc;

use arc_swap::ArcSwap;
use loxinflux_api::DecodedRecord;
use tokio::sync::mpsc;

use crate::delivery::{Batch, DeliveryManager};
use crate::error::CoreError;
use crate::filter::{Decision, FilterRuleSet};
use crate::format::MetricFormatter;
use crate::model::StructureIndex;

const MAX_BATCH: usize = 512;

/// Counters reported when the pipeline stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: u64,
    /// Identifier not in the structure snapshot.
    pub unresolved: u64,
    pub filtered: u64,
    /// Value not expressible as a line (NaN, infinity).
    pub unformattable: u64,
    pub emitted: u64,
}

pub struct Pipeline {
    index: Arc<ArcSwap<StructureIndex>>,
    rules: Arc<FilterRuleSet>,
    formatter: MetricFormatter,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        index: Arc<ArcSwap<StructureIndex>>,
        rules: Arc<FilterRuleSet>,
        formatter: MetricFormatter,
    ) -> Self {
        Self {
            index,
            rules,
            formatter,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Turn one record into a line, or `None` if it is dropped.
    pub fn process(&mut self, index: &StructureIndex, record: &DecodedRecord) -> Option<String> {
        self.stats.received += 1;

        let Some(resolved) = index.resolve(&record.uuid) else {
            self.stats.unresolved += 1;
            tracing::trace!(uuid = %record.uuid, "record not in structure snapshot");
            return None;
        };

        if let Decision::Drop(reason) = self.rules.evaluate(&resolved, record.provenance) {
            self.stats.filtered += 1;
            tracing::trace!(uuid = %record.uuid, %reason, source = %record.provenance, "record filtered");
            return None;
        }

        let Some(line) = self.formatter.format(record, &resolved) else {
            self.stats.unformattable += 1;
            tracing::debug!(uuid = %record.uuid, value = ?record.value, "value not representable, dropped");
            return None;
        };

        self.stats.emitted += 1;
        Some(line)
    }

    /// Consume records until every sender is gone.
    pub async fn run(
        &mut self,
        mut records: mpsc::Receiver<DecodedRecord>,
        delivery: &DeliveryManager,
    ) -> Result<PipelineStats, CoreError> {
        let mut pending = Vec::with_capacity(MAX_BATCH);

        while let Some(first) = records.recv().await {
            pending.push(first);
            while pending.len() < MAX_BATCH {
                match records.try_recv() {
                    Ok(record) => pending.push(record),
                    Err(_) => break,
                }
            }

            let lines: Vec<String> = {
                let index = self.index.load();
                pending
                    .drain(..)
                    .filter_map(|record| self.process(&index, &record))
                    .collect()
            };

            if !lines.is_empty() {
                delivery.deliver(Batch::from(lines)).await?;
            }
        }

        tracing::debug!(stats = ?self.stats, "pipeline drained");
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRules;
    use crate::model::Device;
    use loxinflux_api::{Provenance, RecordValue};
    use pretty_assertions::assert_eq;

    fn pipeline(rules: FilterRuleSet) -> Pipeline {
        let mut temp = Device::new("A1", "Temperature", "Temperature");
        temp.visible = true;
        let index = StructureIndex::new(vec![temp, Device::new("S1", "Light", "Switch")], None);
        Pipeline::new(
            Arc::new(ArcSwap::from_pointee(index)),
            Arc::new(rules),
            MetricFormatter::default(),
        )
    }

    fn process(pipeline: &mut Pipeline, record: &DecodedRecord) -> Option<String> {
        let index = pipeline.index.load_full();
        pipeline.process(&index, record)
    }

    #[test]
    fn counts_every_outcome() {
        let rules = FilterRuleSet::new(["switch"], FilterRules::default(), FilterRules::default());
        let mut pipeline = pipeline(rules);

        let kept = DecodedRecord::new("A1", RecordValue::Number(20.0), Provenance::Push);
        let filtered = DecodedRecord::new("S1", RecordValue::Number(1.0), Provenance::Push);
        let unknown = DecodedRecord::new("ZZ", RecordValue::Number(1.0), Provenance::Push);
        let nan = DecodedRecord::new("A1", RecordValue::Number(f64::NAN), Provenance::Poll);

        assert!(process(&mut pipeline, &kept).is_some());
        assert!(process(&mut pipeline, &filtered).is_none());
        assert!(process(&mut pipeline, &unknown).is_none());
        assert!(process(&mut pipeline, &nan).is_none());

        assert_eq!(
            pipeline.stats(),
            PipelineStats {
                received: 4,
                unresolved: 1,
                filtered: 1,
                unformattable: 1,
                emitted: 1,
            }
        );
    }

    #[test]
    fn reloaded_index_takes_effect() {
        let mut pipeline = pipeline(FilterRuleSet::default());
        let late = DecodedRecord::new("N1", RecordValue::Number(1.0), Provenance::Push);
        assert!(process(&mut pipeline, &late).is_none());

        pipeline.index.store(Arc::new(StructureIndex::new(
            vec![Device::new("N1", "New", "Pushbutton")],
            None,
        )));
        assert!(process(&mut pipeline, &late).is_some());
    }
}
