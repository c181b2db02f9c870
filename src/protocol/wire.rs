//! Protobuf schema for the coordinator/node channel.
//!
//! Every frame is one [`Envelope`]. The `body` oneof is the closed set of
//! message kinds; `kind` repeats the sender's view of its own subtype so a
//! receiver built against an older schema can still name what it skipped.

use std::collections::BTreeMap;

use prost::{Enumeration, Message, Oneof};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Unspecified = 0,
    Hello = 1,
    Ready = 2,
    Scaling = 3,
    Init = 4,
    Execute = 5,
    Cancel = 6,
    DependentValueRequest = 7,
    DependentValueReply = 8,
    JobAccepted = 9,
    JobResult = 10,
}

#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub schema_version: u32,
    #[prost(enumeration = "MessageKind", tag = "2")]
    pub kind: i32,
    #[prost(
        oneof = "envelope::Body",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19"
    )]
    pub body: Option<envelope::Body>,
}

pub mod envelope {
    use super::*;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Body {
        #[prost(message, tag = "10")]
        Hello(HelloProto),
        #[prost(message, tag = "11")]
        Ready(ReadyProto),
        #[prost(message, tag = "12")]
        Scaling(ScalingProto),
        #[prost(message, tag = "13")]
        Init(InitProto),
        #[prost(message, tag = "14")]
        Execute(JobProto),
        #[prost(message, tag = "15")]
        Cancel(CancelProto),
        #[prost(message, tag = "16")]
        DependentValueRequest(DependentValueRequestProto),
        #[prost(message, tag = "17")]
        DependentValueReply(DependentValueReplyProto),
        #[prost(message, tag = "18")]
        JobAccepted(JobSpecificationProto),
        #[prost(message, tag = "19")]
        JobResult(JobResultProto),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloProto {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint32, tag = "2")]
    pub slots: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReadyProto {
    #[prost(int32, tag = "1")]
    pub capacity: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ScalingProto {
    #[prost(double, tag = "1")]
    pub invocation_cost_scale: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct InitProto {
    #[prost(int64, tag = "1")]
    pub function_repository_version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct JobSpecificationProto {
    #[prost(bytes = "vec", tag = "1")]
    pub session_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub cycle_id: u64,
    #[prost(uint64, tag = "3")]
    pub job_id: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueSpecificationProto {
    #[prost(string, tag = "1")]
    pub target: String,
    #[prost(string, tag = "2")]
    pub value_name: String,
    #[prost(btree_map = "string, string", tag = "3")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct JobItemProto {
    #[prost(string, tag = "1")]
    pub function_id: String,
    #[prost(string, tag = "2")]
    pub target: String,
    #[prost(message, repeated, tag = "3")]
    pub inputs: Vec<ValueSpecificationProto>,
    #[prost(message, repeated, tag = "4")]
    pub outputs: Vec<ValueSpecificationProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct JobProto {
    #[prost(message, optional, tag = "1")]
    pub specification: Option<JobSpecificationProto>,
    #[prost(int64, tag = "2")]
    pub function_repository_version: i64,
    #[prost(message, repeated, tag = "3")]
    pub items: Vec<JobItemProto>,
    #[prost(message, repeated, tag = "4")]
    pub private_values: Vec<ValueSpecificationProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CancelProto {
    #[prost(message, repeated, tag = "1")]
    pub jobs: Vec<JobSpecificationProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DependentValueRequestProto {
    #[prost(int64, tag = "1")]
    pub correlation_id: i64,
    #[prost(message, optional, tag = "2")]
    pub job: Option<JobSpecificationProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DependentValueReplyProto {
    #[prost(int64, tag = "1")]
    pub correlation_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub values: Vec<ValueSpecificationProto>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum ItemStatusKind {
    Unspecified = 0,
    Success = 1,
    Failure = 2,
    MissingInputs = 3,
    Suppressed = 4,
}

#[derive(Clone, PartialEq, Message)]
pub struct JobResultItemProto {
    #[prost(string, tag = "1")]
    pub function_id: String,
    #[prost(enumeration = "ItemStatusKind", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub reason: String,
    #[prost(message, repeated, tag = "4")]
    pub missing: Vec<ValueSpecificationProto>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum OutcomeKind {
    Unspecified = 0,
    Completed = 1,
    Failed = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct JobResultProto {
    #[prost(message, optional, tag = "1")]
    pub job: Option<JobSpecificationProto>,
    #[prost(enumeration = "OutcomeKind", tag = "2")]
    pub outcome: i32,
    #[prost(string, tag = "3")]
    pub failure_reason: String,
    #[prost(uint64, tag = "4")]
    pub duration_nanos: u64,
    #[prost(message, repeated, tag = "5")]
    pub items: Vec<JobResultItemProto>,
}
