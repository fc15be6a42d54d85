//! Fault-tolerance scenarios (spec §4.6, §7): a torn-down peer surfaces as
//! `TransportError::CommunicatorTorn` rather than hanging, and the
//! Instantiator can re-derive a layout for a smaller world after a worker
//! is lost.

use pipeline_trainer::transport::mock::channel_pair;
use pipeline_trainer::{DType, Instantiator, OwnedTensor, PipelineTemplate, Transport, TransportError};

/// Dropping the peer's end of the mock link mid-exchange surfaces
/// `CommunicatorTorn` instead of hanging forever.
#[tokio::test]
async fn dropped_peer_surfaces_communicator_torn() {
    let (link_a, link_b) = channel_pair();
    let mut sender = Transport::new(0, None, Some(Box::new(link_a)));

    // Drop the receiving end entirely — nothing will ever read these frames.
    drop(link_b);

    let tensors = vec![OwnedTensor::zeros_like(vec![2, 2], DType::F32, true)];
    let result = sender.send_activation(0, &tensors).await;
    assert!(matches!(result, Err(TransportError::CommunicatorTorn { .. })));
}

/// After losing one worker, the Instantiator can still find a feasible
/// layout among smaller templates, without restarting the whole job.
#[test]
fn instantiator_finds_smaller_layout_after_worker_loss() {
    let templates = vec![
        PipelineTemplate::uniform("t4", 4, 2),
        PipelineTemplate::uniform("t2", 2, 4),
    ];
    let pool: std::collections::BTreeMap<_, _> = templates
        .into_iter()
        .map(|t| (t.template_id.clone(), t))
        .collect();
    let instantiator = Instantiator::new(1);

    let full_world = instantiator.instantiate(&pool, 4, 16).unwrap();
    assert_eq!(full_world.total_microbatches(), 16);

    // World shrinks from 4 to 2 workers (one peer lost).
    let reduced_world = instantiator.instantiate(&pool, 2, 16).unwrap();
    assert_eq!(reduced_world.total_microbatches(), 16);
    for replica in &reduced_world.replicas {
        assert_eq!(reduced_world.template_for(replica).unwrap().num_nodes(), 2);
    }
}
