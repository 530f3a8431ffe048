//! Generated cost-source wire types. The protobuf schema lives in
//! `proto/costsource.proto` and is compiled by tonic-build; plugins must be
//! bit-compatible with it.

pub mod costsource {
    pub mod v1 {
        tonic::include_proto!("pulumicost.costsource.v1");
    }
}

pub use costsource::v1::cost_source_client::CostSourceClient;
pub use costsource::v1::cost_source_server::{CostSource, CostSourceServer};
pub use costsource::v1::{
    CostEntry, GetActualCostRequest, GetActualCostResponse, GetCapabilitiesRequest,
    GetCapabilitiesResponse, GetProjectedCostRequest, GetProjectedCostResponse,
    HealthCheckRequest, HealthCheckResponse, NameRequest, NameResponse, ResourceDescriptor,
};
