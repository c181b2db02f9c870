use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::protocol::wire::{
    envelope::Body, CancelProto, DependentValueReplyProto, DependentValueRequestProto, Envelope,
    HelloProto, InitProto, ItemStatusKind, JobItemProto, JobProto, JobResultItemProto,
    JobResultProto, JobSpecificationProto, MessageKind, OutcomeKind, ReadyProto, ScalingProto,
    ValueSpecificationProto,
};
use crate::scheduler::job::{
    CacheHint, ItemStatus, Job, JobItem, JobOutcome, JobResultItem, JobSpecification,
    ValueSpecification,
};

/// Schema revision written into every envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// Everything that travels over a node connection, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First frame from a node: who it is and how many slots it runs.
    Hello { node_id: String, slots: u32 },
    Ready { capacity: i32 },
    Scaling { invocation_cost_scale: f64 },
    Init { function_repository_version: i64 },
    Execute { job: Arc<Job> },
    Cancel { jobs: Vec<JobSpecification> },
    DependentValueRequest {
        correlation_id: i64,
        job: JobSpecification,
    },
    DependentValueReply {
        correlation_id: i64,
        values: Vec<ValueSpecification>,
    },
    JobAccepted { job: JobSpecification },
    JobResult {
        job: JobSpecification,
        outcome: JobOutcome,
    },
}

/// One decoded frame. Unknown bodies are not errors: a newer peer may send
/// kinds this build has never heard of.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Unknown { kind: i32, schema_version: u32 },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Ready { .. } => MessageKind::Ready,
            Message::Scaling { .. } => MessageKind::Scaling,
            Message::Init { .. } => MessageKind::Init,
            Message::Execute { .. } => MessageKind::Execute,
            Message::Cancel { .. } => MessageKind::Cancel,
            Message::DependentValueRequest { .. } => MessageKind::DependentValueRequest,
            Message::DependentValueReply { .. } => MessageKind::DependentValueReply,
            Message::JobAccepted { .. } => MessageKind::JobAccepted,
            Message::JobResult { .. } => MessageKind::JobResult,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let body = match self {
            Message::Hello { node_id, slots } => Body::Hello(HelloProto {
                node_id: node_id.clone(),
                slots: *slots,
            }),
            Message::Ready { capacity } => Body::Ready(ReadyProto {
                capacity: *capacity,
            }),
            Message::Scaling {
                invocation_cost_scale,
            } => Body::Scaling(ScalingProto {
                invocation_cost_scale: *invocation_cost_scale,
            }),
            Message::Init {
                function_repository_version,
            } => Body::Init(InitProto {
                function_repository_version: *function_repository_version,
            }),
            Message::Execute { job } => Body::Execute(JobProto::from(job.as_ref())),
            Message::Cancel { jobs } => Body::Cancel(CancelProto {
                jobs: jobs.iter().map(JobSpecificationProto::from).collect(),
            }),
            Message::DependentValueRequest {
                correlation_id,
                job,
            } => Body::DependentValueRequest(DependentValueRequestProto {
                correlation_id: *correlation_id,
                job: Some(job.into()),
            }),
            Message::DependentValueReply {
                correlation_id,
                values,
            } => Body::DependentValueReply(DependentValueReplyProto {
                correlation_id: *correlation_id,
                values: values.iter().map(ValueSpecificationProto::from).collect(),
            }),
            Message::JobAccepted { job } => Body::JobAccepted(job.into()),
            Message::JobResult { job, outcome } => Body::JobResult(job_result_proto(job, outcome)),
        };
        Envelope {
            schema_version: SCHEMA_VERSION,
            kind: self.kind() as i32,
            body: Some(body),
        }
    }
}

impl TryFrom<Envelope> for Frame {
    type Error = GridError;

    fn try_from(envelope: Envelope) -> Result<Self> {
        let Some(body) = envelope.body else {
            return Ok(Frame::Unknown {
                kind: envelope.kind,
                schema_version: envelope.schema_version,
            });
        };
        let message = match body {
            Body::Hello(hello) => {
                if hello.node_id.is_empty() {
                    return Err(GridError::Protocol("hello without node id".to_string()));
                }
                Message::Hello {
                    node_id: hello.node_id,
                    slots: hello.slots,
                }
            }
            Body::Ready(ready) => Message::Ready {
                capacity: ready.capacity,
            },
            Body::Scaling(scaling) => Message::Scaling {
                invocation_cost_scale: scaling.invocation_cost_scale,
            },
            Body::Init(init) => Message::Init {
                function_repository_version: init.function_repository_version,
            },
            Body::Execute(job) => Message::Execute {
                job: Arc::new(Job::try_from(job)?),
            },
            Body::Cancel(cancel) => Message::Cancel {
                jobs: cancel
                    .jobs
                    .into_iter()
                    .map(JobSpecification::try_from)
                    .collect::<Result<_>>()?,
            },
            Body::DependentValueRequest(request) => Message::DependentValueRequest {
                correlation_id: request.correlation_id,
                job: required_spec(request.job)?,
            },
            Body::DependentValueReply(reply) => Message::DependentValueReply {
                correlation_id: reply.correlation_id,
                values: reply.values.into_iter().map(Into::into).collect(),
            },
            Body::JobAccepted(spec) => Message::JobAccepted {
                job: spec.try_into()?,
            },
            Body::JobResult(result) => job_result_message(result)?,
        };
        Ok(Frame::Message(message))
    }
}

fn required_spec(spec: Option<JobSpecificationProto>) -> Result<JobSpecification> {
    spec.ok_or_else(|| GridError::Protocol("missing job specification".to_string()))?
        .try_into()
}

impl From<&JobSpecification> for JobSpecificationProto {
    fn from(spec: &JobSpecification) -> Self {
        Self {
            session_id: spec.session_id.as_bytes().to_vec(),
            cycle_id: spec.cycle_id,
            job_id: spec.job_id,
        }
    }
}

impl TryFrom<JobSpecificationProto> for JobSpecification {
    type Error = GridError;

    fn try_from(proto: JobSpecificationProto) -> Result<Self> {
        let session_id = Uuid::from_slice(&proto.session_id)
            .map_err(|e| GridError::Protocol(format!("invalid session id: {}", e)))?;
        Ok(JobSpecification::new(session_id, proto.cycle_id, proto.job_id))
    }
}

impl From<&ValueSpecification> for ValueSpecificationProto {
    fn from(value: &ValueSpecification) -> Self {
        Self {
            target: value.target.clone(),
            value_name: value.value_name.clone(),
            properties: value.properties.clone(),
        }
    }
}

impl From<ValueSpecificationProto> for ValueSpecification {
    fn from(proto: ValueSpecificationProto) -> Self {
        Self {
            target: proto.target,
            value_name: proto.value_name,
            properties: proto.properties,
        }
    }
}

impl From<&JobItem> for JobItemProto {
    fn from(item: &JobItem) -> Self {
        Self {
            function_id: item.function_id.clone(),
            target: item.target.clone(),
            inputs: item.inputs.iter().map(Into::into).collect(),
            outputs: item.outputs.iter().map(Into::into).collect(),
        }
    }
}

impl From<JobItemProto> for JobItem {
    fn from(proto: JobItemProto) -> Self {
        Self {
            function_id: proto.function_id,
            target: proto.target,
            inputs: proto.inputs.into_iter().map(Into::into).collect(),
            outputs: proto.outputs.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&Job> for JobProto {
    fn from(job: &Job) -> Self {
        Self {
            specification: Some((&job.specification).into()),
            function_repository_version: job.function_repository_version,
            items: job.items.iter().map(Into::into).collect(),
            private_values: job
                .cache_hint
                .private_values
                .iter()
                .map(Into::into)
                .collect(),
        }
    }
}

impl TryFrom<JobProto> for Job {
    type Error = GridError;

    fn try_from(proto: JobProto) -> Result<Self> {
        Ok(Job {
            specification: required_spec(proto.specification)?,
            function_repository_version: proto.function_repository_version,
            items: proto.items.into_iter().map(Into::into).collect(),
            cache_hint: CacheHint {
                private_values: proto.private_values.into_iter().map(Into::into).collect(),
            },
        })
    }
}

fn job_result_proto(job: &JobSpecification, outcome: &JobOutcome) -> JobResultProto {
    match outcome {
        JobOutcome::Completed { items, duration } => JobResultProto {
            job: Some(job.into()),
            outcome: OutcomeKind::Completed as i32,
            failure_reason: String::new(),
            duration_nanos: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            items: items.iter().map(result_item_proto).collect(),
        },
        JobOutcome::Failed { reason } => JobResultProto {
            job: Some(job.into()),
            outcome: OutcomeKind::Failed as i32,
            failure_reason: reason.clone(),
            duration_nanos: 0,
            items: Vec::new(),
        },
    }
}

fn result_item_proto(item: &JobResultItem) -> JobResultItemProto {
    let (status, reason, missing) = match &item.status {
        ItemStatus::Success => (ItemStatusKind::Success, String::new(), Vec::new()),
        ItemStatus::Failure(reason) => (ItemStatusKind::Failure, reason.clone(), Vec::new()),
        ItemStatus::MissingInputs(values) => (
            ItemStatusKind::MissingInputs,
            String::new(),
            values.iter().map(Into::into).collect(),
        ),
        ItemStatus::Suppressed => (ItemStatusKind::Suppressed, String::new(), Vec::new()),
    };
    JobResultItemProto {
        function_id: item.function_id.clone(),
        status: status as i32,
        reason,
        missing,
    }
}

fn job_result_message(proto: JobResultProto) -> Result<Message> {
    let job = required_spec(proto.job)?;
    let outcome = match OutcomeKind::try_from(proto.outcome) {
        Ok(OutcomeKind::Completed) => JobOutcome::Completed {
            items: proto
                .items
                .into_iter()
                .map(result_item)
                .collect::<Result<_>>()?,
            duration: Duration::from_nanos(proto.duration_nanos),
        },
        Ok(OutcomeKind::Failed) => JobOutcome::Failed {
            reason: proto.failure_reason,
        },
        _ => {
            return Err(GridError::Protocol(format!(
                "job result with unknown outcome {}",
                proto.outcome
            )))
        }
    };
    Ok(Message::JobResult { job, outcome })
}

fn result_item(proto: JobResultItemProto) -> Result<JobResultItem> {
    let status = match ItemStatusKind::try_from(proto.status) {
        Ok(ItemStatusKind::Success) => ItemStatus::Success,
        Ok(ItemStatusKind::Failure) => ItemStatus::Failure(proto.reason),
        Ok(ItemStatusKind::MissingInputs) => {
            ItemStatus::MissingInputs(proto.missing.into_iter().map(Into::into).collect())
        }
        Ok(ItemStatusKind::Suppressed) => ItemStatus::Suppressed,
        _ => {
            return Err(GridError::Protocol(format!(
                "result item with unknown status {}",
                proto.status
            )))
        }
    };
    Ok(JobResultItem {
        function_id: proto.function_id,
        status,
    })
}
