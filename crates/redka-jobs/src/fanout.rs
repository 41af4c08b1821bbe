//! Copies each job from one queue to several destinations.

use crate::handler::Handlers;
use crate::job::EnqueueOptions;
use crate::producer::JobProducer;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where a fanned-out copy goes. The queue is given without the key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub queue: String,
    pub name: String,
}

impl Destination {
    pub fn new(queue: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            name: name.into(),
        }
    }
}

/// Source job name to its destinations.
pub type FanoutConfig = HashMap<String, Vec<Destination>>;

/// Builds handlers that enqueue one copy of the params per destination.
///
/// Copies are written concurrently. If one write fails the source job fails
/// and copies already written stay enqueued. The source job's result is the
/// list of copy ids.
pub fn fanout_handlers(producer: JobProducer, config: &FanoutConfig) -> Handlers {
    config
        .iter()
        .fold(Handlers::new(), |handlers, (job_name, destinations)| {
            let producer = producer.clone();
            let destinations = destinations.clone();
            handlers.on(job_name.clone(), move |params: Value, _ctx| {
                let producer = producer.clone();
                let destinations = destinations.clone();
                async move {
                    let ids = try_join_all(destinations.iter().map(|destination| {
                        producer.enqueue(
                            &destination.queue,
                            &destination.name,
                            params.clone(),
                            EnqueueOptions::default(),
                        )
                    }))
                    .await?;
                    Ok::<_, anyhow::Error>(Value::from(
                        ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    ))
                }
            })
        })
}
