use crate::vmx::vmcs::{
    field::{FieldType, VmcsField},
    Vmcs,
};

fn group_name(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Control => "Control fields",
        FieldType::ExitInfo => "VM-exit information",
        FieldType::Guest => "Guest state",
        FieldType::Host => "Host state",
    }
}

/// Logs every field of the VMCS, grouped by field type.
pub fn dump_vmcs(vmcs: &Vmcs) {
    log::info!(
        "VMCS revision {:#x} (shadow: {}), launch state {:?}, abort {}",
        vmcs.revision_id(),
        vmcs.is_shadow(),
        vmcs.launch_state(),
        vmcs.abort_indicator()
    );

    for ty in [FieldType::Control, FieldType::ExitInfo, FieldType::Guest, FieldType::Host] {
        log::info!("{}:", group_name(ty));

        VmcsField::ALL
            .iter()
            .filter(|field| field.field_type() == ty)
            .for_each(|field| log::info!("  {:<24?} {:#018x}", field, vmcs.get(*field)));
    }
}
