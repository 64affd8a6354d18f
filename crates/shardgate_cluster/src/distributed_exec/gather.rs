//! Gather phase: merge per-shard results.

use shardgate_common::bind::QueryResult;
use shardgate_common::error::{GatewayError, GatewayResult};

use super::ScatterBatchRequest;

/// Merge shard results in dispatch order.
pub fn merge_results(results: impl IntoIterator<Item = QueryResult>) -> QueryResult {
    let mut merged = QueryResult::empty();
    for result in results {
        merged.append(result);
    }
    merged
}

/// Put per-shard batch results back into the caller's query order.
///
/// `shard_results[i]` holds the results of `request.batches[i]`, one per
/// query. A query sent to several shards gets their results appended.
pub fn reassemble_batch(
    request: &ScatterBatchRequest,
    shard_results: Vec<Vec<QueryResult>>,
) -> GatewayResult<Vec<QueryResult>> {
    if shard_results.len() != request.batches.len() {
        return Err(GatewayError::internal_bug(
            "E-GATHER-001",
            "batch result count does not match shard count",
            format!(
                "shards={} results={}",
                request.batches.len(),
                shard_results.len()
            ),
        ));
    }

    let mut out = vec![QueryResult::empty(); request.result_count];
    for (batch, results) in request.batches.iter().zip(shard_results) {
        if results.len() != batch.result_indexes.len() {
            return Err(GatewayError::internal_bug(
                "E-GATHER-002",
                format!("shard {} returned a short batch", batch.target),
                format!(
                    "queries={} results={}",
                    batch.result_indexes.len(),
                    results.len()
                ),
            ));
        }
        for (&index, result) in batch.result_indexes.iter().zip(results) {
            let slot = out.get_mut(index).ok_or_else(|| {
                GatewayError::internal_bug(
                    "E-GATHER-003",
                    "batch result index out of range",
                    format!("index={index} result_count={}", request.result_count),
                )
            })?;
            slot.append(result);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardgate_common::bind::{BindValue, BoundQuery, Field};
    use shardgate_common::types::{ShardTarget, TabletRole};

    fn rows(vals: &[i64]) -> QueryResult {
        QueryResult {
            fields: vec![Field::new("id", "INT64")],
            rows: vals.iter().map(|v| vec![BindValue::Int64(*v)]).collect(),
            rows_affected: vals.len() as u64,
            insert_id: 0,
        }
    }

    fn target(shard: &str) -> ShardTarget {
        ShardTarget::new("ks", shard, TabletRole::Primary)
    }

    #[test]
    fn test_merge_results_in_order() {
        let merged = merge_results(vec![QueryResult::empty(), rows(&[1, 2]), rows(&[3])]);
        assert_eq!(merged.fields.len(), 1);
        assert_eq!(merged.rows.len(), 3);
        assert_eq!(merged.rows[2], vec![BindValue::Int64(3)]);
        assert_eq!(merged.rows_affected, 3);
    }

    #[test]
    fn test_reassemble_batch() {
        let mut req = ScatterBatchRequest::new(2);
        req.add(target("-20"), BoundQuery::new("q0"), 0);
        req.add(target("-20"), BoundQuery::new("q1"), 1);
        req.add(target("20-40"), BoundQuery::new("q0"), 0);

        let out = reassemble_batch(&req, vec![vec![rows(&[1]), rows(&[9])], vec![rows(&[2])]])
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].rows, vec![vec![BindValue::Int64(1)], vec![BindValue::Int64(2)]]);
        assert_eq!(out[1].rows, vec![vec![BindValue::Int64(9)]]);
    }

    #[test]
    fn test_short_batch_is_internal_bug() {
        let mut req = ScatterBatchRequest::new(2);
        req.add(target("-20"), BoundQuery::new("q0"), 0);
        req.add(target("-20"), BoundQuery::new("q1"), 1);
        let err = reassemble_batch(&req, vec![vec![rows(&[1])]]).unwrap_err();
        assert!(err.is_internal_bug());

        let err = reassemble_batch(&req, vec![]).unwrap_err();
        assert!(err.is_internal_bug());
    }
}
