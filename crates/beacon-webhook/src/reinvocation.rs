//! Repair of already injected Pods
//!
//! Admission can run again after other webhooks add containers. Containers
//! missing an enabled capability are retrofitted with the same pipeline the
//! first injection used; containers already covered are left alone, so a
//! second pass over a repaired Pod changes nothing.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, warn};

use crate::container::{has_data_ingest, has_one_agent, instrument, ContainerPlan};
use crate::init_container::{
    find_install_container, recorded_workload, sync_container_entries, INSTALL_CONTAINER_NAME,
};
use crate::injector::Injection;

/// Retrofit uncovered containers of an injected Pod.
///
/// The workload identity for enrichment is read back from the install init
/// container, not from the passed [`Injection`]. Returns whether the Pod
/// changed.
pub fn retrofit(pod: &mut Pod, injection: &Injection<'_>) -> bool {
    let recorded = find_install_container(pod).and_then(|ic| recorded_workload(ic));
    let has_install_container = find_install_container(pod).is_some();
    let injection = Injection {
        workload: recorded.as_ref(),
        ..*injection
    };
    let plan = injection.plan();
    if plan.is_empty() {
        return false;
    }

    let Some(spec) = pod.spec.as_mut() else {
        return false;
    };

    let mut changed = false;
    for container in spec.containers.iter_mut() {
        let mut needs_agent = plan.one_agent.is_some() && !has_one_agent(container);
        let needs_ingest = plan.data_ingest.is_some() && !has_data_ingest(container);
        if needs_agent && !has_install_container {
            warn!(
                container = %container.name,
                "install container missing, skipping agent retrofit"
            );
            needs_agent = false;
        }

        let restricted: ContainerPlan<'_> = plan.restricted(needs_agent, needs_ingest);
        if restricted.is_empty() {
            continue;
        }

        debug!(
            container = %container.name,
            agent = needs_agent,
            enrichment = needs_ingest,
            "retrofitting container"
        );
        *container = instrument(std::mem::take(container), &restricted);
        changed = true;
    }

    // Containers may have been inserted ahead of covered ones, so entries are
    // re-indexed against the current order.
    if plan.one_agent.is_some() {
        let install = spec
            .init_containers
            .as_mut()
            .and_then(|ics| ics.iter_mut().find(|c| c.name == INSTALL_CONTAINER_NAME));
        if let Some(install) = install {
            changed |= sync_container_entries(install, &spec.containers);
        }
    }
    changed
}
