//! gRPC messages and service plumbing
//!
//! With the `proto-gen` feature everything is generated at build time by
//! tonic-build from `proto/labeler.proto` and `proto/topology-updater.proto`.
//!
//! Without it (no protoc available) the message types below are maintained
//! by hand and the build script generates only the servers. Only the server
//! side is provided; workers are separate programs.
//!
//! Map fields use `BTreeMap` so feature labels arrive in key order.

#[cfg(feature = "proto-gen")]
pub mod labeler {
    tonic::include_proto!("v1alpha1");
}

#[cfg(feature = "proto-gen")]
pub mod topology {
    tonic::include_proto!("topologyupdater");
}

#[cfg(not(feature = "proto-gen"))]
pub mod labeler {
    use prost::Message;
    use std::collections::BTreeMap;

    #[derive(Clone, PartialEq, Message)]
    pub struct SetLabelsRequest {
        #[prost(string, tag = "1")]
        pub nfd_version: String,
        #[prost(string, tag = "2")]
        pub node_name: String,
        #[prost(btree_map = "string, string", tag = "3")]
        pub labels: BTreeMap<String, String>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct SetLabelsReply {}

    include!(concat!(env!("OUT_DIR"), "/v1alpha1.Labeler.rs"));
}

#[cfg(not(feature = "proto-gen"))]
pub mod topology {
    use prost::Message;
    use std::collections::BTreeMap;

    #[derive(Clone, PartialEq, Message)]
    pub struct NodeTopologyRequest {
        #[prost(string, tag = "1")]
        pub nfd_version: String,
        #[prost(string, tag = "2")]
        pub node_name: String,
        #[prost(string, repeated, tag = "3")]
        pub topology_policies: Vec<String>,
        #[prost(btree_map = "string, message", tag = "4")]
        pub zones: BTreeMap<String, Zone>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NodeTopologyResponse {}

    #[derive(Clone, PartialEq, Message)]
    pub struct Zone {
        #[prost(string, tag = "1")]
        pub r#type: String,
        #[prost(string, tag = "2")]
        pub parent: String,
        #[prost(btree_map = "string, int32", tag = "3")]
        pub costs: BTreeMap<String, i32>,
        #[prost(btree_map = "string, message", tag = "4")]
        pub resources: BTreeMap<String, ResourceInfo>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ResourceInfo {
        #[prost(int64, tag = "1")]
        pub allocatable: i64,
        #[prost(int64, tag = "2")]
        pub capacity: i64,
    }

    include!(concat!(env!("OUT_DIR"), "/topologyupdater.NodeTopology.rs"));
}

pub use labeler::labeler_server::{Labeler, LabelerServer};
pub use labeler::{SetLabelsReply, SetLabelsRequest};
pub use topology::node_topology_server::{NodeTopology, NodeTopologyServer};
pub use topology::{NodeTopologyRequest, NodeTopologyResponse};
