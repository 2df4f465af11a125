//! Custom Resource Definitions for Beacon

mod workload_config;

pub use workload_config::{
    ActiveGateSpec, AppInjectionSpec, ApplicationMonitoringSpec, FeatureFlags, HostInjectSpec,
    InitResources, InstallMode, OneAgentSpec, ProxySpec, WorkloadConfig, WorkloadConfigSpec,
};
