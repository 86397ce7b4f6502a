use crate::vmx::{
    instr::{DecodedInstr, Operand},
    vmcs::info::ExitInstrInfo,
};

/// Builds the VM-exit instruction-information field for an instruction with a ModR/M operand.
///
/// The index and base fields report register 0 when the register is absent, the matching invalid bit
/// tells the guest hypervisor to ignore them.
pub fn build_instr_info(decoded: &DecodedInstr) -> ExitInstrInfo {
    let mut info = ExitInstrInfo(0);
    info.set_reg2(decoded.reg & 0xf);

    match &decoded.rm {
        Operand::Reg(reg) => {
            info.set_is_reg_operand(true);
            info.set_reg1(*reg & 0xf);
        }
        Operand::Mem(mem) => {
            info.set_scaling(mem.scale & 0b11);
            info.set_addr_size(mem.addr_size as u8);
            info.set_segment(mem.seg as u8);
            info.set_index_reg(mem.index.unwrap_or_default() & 0xf);
            info.set_index_invalid(mem.index.is_none());
            info.set_base_reg(mem.base.unwrap_or_default() & 0xf);
            info.set_base_invalid(mem.base.is_none());
        }
    }

    info
}

/// Exit qualification of VMX instructions: the displacement of a memory operand.
pub fn instr_qualification(decoded: &DecodedInstr) -> u64 {
    decoded.mem().map(|mem| mem.disp).unwrap_or_default()
}
