//! Launch/resume across the REPL phase program: each exit reports a command
//! code, the bridge resumes at the next phase label, and the loop-back phase
//! returns to the first command.

use faultline_engine::programs::{
    emit_repl_phases, CMD_READ_BYTE, CMD_RECV_RESPONSE, CMD_SEND_QUERY,
};
use faultline_engine::{CascadeConfig, EngineError, InstIdx, MachineState, WeirdMachine};
use pretty_assertions::assert_eq;

#[test]
fn repl_phases_report_the_expected_command_sequence() {
    let mut m = WeirdMachine::new(CascadeConfig::default());
    m.setup().unwrap();
    let repl = emit_repl_phases(&mut m).unwrap();
    m.finalise().unwrap();

    let mut seen = Vec::new();

    m.launch().unwrap();
    seen.push(m.read_register(repl.command).unwrap());
    assert_eq!(m.state(), MachineState::Exited);

    for phase in &repl.phases[1..] {
        m.resume(*phase).unwrap();
        seen.push(m.read_register(repl.command).unwrap());
    }

    assert_eq!(
        seen,
        vec![CMD_READ_BYTE, CMD_SEND_QUERY, CMD_RECV_RESPONSE, CMD_READ_BYTE]
    );
}

#[test]
fn resume_targets_must_hold_an_instruction() {
    let mut m = WeirdMachine::new(CascadeConfig::default());
    m.setup().unwrap();
    let repl = emit_repl_phases(&mut m).unwrap();
    m.finalise().unwrap();
    m.launch().unwrap();

    assert!(matches!(
        m.resume(InstIdx(200)),
        Err(EngineError::EmptySlot(200))
    ));

    // A valid phase still works after the failed attempt.
    m.resume(repl.phases[1]).unwrap();
    assert_eq!(m.read_register(repl.command).unwrap(), CMD_SEND_QUERY);
}

#[test]
fn resume_requires_a_finalised_program() {
    let mut m = WeirdMachine::new(CascadeConfig::default());
    m.setup().unwrap();
    let repl = emit_repl_phases(&mut m).unwrap();
    assert!(matches!(
        m.resume(repl.phases[0]),
        Err(EngineError::NotFinalised)
    ));
}
