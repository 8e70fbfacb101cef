use crate::protocol::{OperationStep, Operator, WorkDispatch};

/// Apply a single step to `value`.
///
/// Arithmetic wraps on 32 bits and rotations use the operand modulo 32.
/// `Not` ignores its operand.
pub fn apply_step(value: u32, step: &OperationStep) -> u32 {
    let n = step.operand;
    match step.operator {
        Operator::Add => value.wrapping_add(n),
        Operator::SubRight => value.wrapping_sub(n),
        Operator::SubLeft => n.wrapping_sub(value),
        Operator::And => value & n,
        Operator::Or => value | n,
        Operator::Xor => value ^ n,
        Operator::Not => !value,
        Operator::RotateRight => value.rotate_right(n % 32),
        Operator::RotateLeft => value.rotate_left(n % 32),
    }
}

/// Run the chain over `item` `iterations` times and reinterpret the result as
/// the signed answer sent back to the scheduler.
pub fn apply_chain(item: u32, chain: &[OperationStep], iterations: u32) -> i32 {
    let mut value = item;
    for _ in 0..iterations {
        value = chain.iter().fold(value, apply_step);
    }
    value as i32
}

/// Compute the answer for a dispatched work item.
pub fn execute(dispatch: &WorkDispatch) -> i32 {
    apply_chain(dispatch.item, &dispatch.operations, dispatch.iterations)
}
