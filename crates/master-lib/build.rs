//! Build script for generating protobuf code
//!
//! With the `proto-gen` feature the messages and servers are generated from
//! `proto/*.proto` by tonic-build, which requires protoc. Without it the
//! message types are maintained in `src/proto/mod.rs` and only the server
//! plumbing is generated, from service descriptions declared below.

use tonic_build::manual::{Builder, Method, Service};

const PROTOS: &[&str] = &["proto/labeler.proto", "proto/topology-updater.proto"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for proto in PROTOS {
        println!("cargo:rerun-if-changed={}", proto);
    }

    if std::env::var_os("CARGO_FEATURE_PROTO_GEN").is_some() {
        tonic_build::configure()
            .build_server(true)
            .build_client(false)
            .btree_map(["."])
            .compile(PROTOS, &["proto"])?;
        return Ok(());
    }

    Builder::new()
        .build_client(false)
        .compile(&[labeler_service(), node_topology_service()]);

    Ok(())
}

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn labeler_service() -> Service {
    Service::builder()
        .name("Labeler")
        .package("v1alpha1")
        .method(unary(
            "set_labels",
            "SetLabels",
            "super::SetLabelsRequest",
            "super::SetLabelsReply",
        ))
        .build()
}

fn node_topology_service() -> Service {
    Service::builder()
        .name("NodeTopology")
        .package("topologyupdater")
        .method(unary(
            "update_node_topology",
            "UpdateNodeTopology",
            "super::NodeTopologyRequest",
            "super::NodeTopologyResponse",
        ))
        .build()
}
