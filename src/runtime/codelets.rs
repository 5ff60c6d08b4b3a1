use super::bytecodes::Bytecode;
use crate::error::DecodeError;

pub const NUMBER_OF_STATES: usize = 10;
pub const NUMBER_OF_RETURN_ENTRIES: usize = 6;
pub const NUMBER_OF_RETURN_ADDRS: usize = 10;
pub const NUMBER_OF_METHOD_ENTRIES: usize = 34;
pub const NUMBER_OF_RESULT_HANDLERS: usize = 10;
pub const NUMBER_OF_DEOPT_ENTRIES: usize = 7;
pub const DISPATCH_LENGTH: usize = 256;

/// Number of meaningful address slots in the interpreter-info blob, in the
/// canonical order `CodeletTable::from_slots` expects.
pub const CODELET_SLOT_COUNT: usize = 2 // low/high bound
    + 2 // unimplemented, illegal sequence
    + NUMBER_OF_RETURN_ENTRIES * NUMBER_OF_STATES
    + 3 * NUMBER_OF_RETURN_ADDRS
    + NUMBER_OF_RESULT_HANDLERS
    + 2 // rethrow, throw
    + 2 // remove_activation (preserving args first)
    + 6 // the throw_* family
    + NUMBER_OF_METHOD_ENTRIES
    + DISPATCH_LENGTH * NUMBER_OF_STATES
    + DISPATCH_LENGTH
    + NUMBER_OF_DEOPT_ENTRIES * NUMBER_OF_STATES
    + 1; // deopt_reexecute_return

/// What an interpreter instruction pointer means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codelet {
    Illegal,
    UnimplementedBytecode,
    IllegalBytecodeSequence,
    Return,
    InvokeReturn,
    InvokeinterfaceReturn,
    InvokedynamicReturn,
    ResultHandler,
    RethrowException,
    ThrowException,
    RemoveActivationPreservingArgs,
    RemoveActivation,
    ThrowArrayIndexOutOfBounds,
    ThrowArrayStore,
    ThrowArithmetic,
    ThrowClassCast,
    ThrowNullPointer,
    ThrowStackOverflow,
    MethodEntry,
    Bytecode(Bytecode),
    Deopt,
    DeoptReexecuteReturn,
}

/// The closed set of interpreter codelet addresses, loaded once from the
/// dump's interpreter-info record. Pure lookups after that.
pub struct CodeletTable {
    low_bound: u64,
    high_bound: u64,
    unimplemented_bytecode: u64,
    illegal_bytecode_sequence: u64,
    return_entry: [[u64; NUMBER_OF_STATES]; NUMBER_OF_RETURN_ENTRIES],
    invoke_return_entry: [u64; NUMBER_OF_RETURN_ADDRS],
    invokeinterface_return_entry: [u64; NUMBER_OF_RETURN_ADDRS],
    invokedynamic_return_entry: [u64; NUMBER_OF_RETURN_ADDRS],
    native_abi_to_tosca: [u64; NUMBER_OF_RESULT_HANDLERS],
    rethrow_exception_entry: u64,
    throw_exception_entry: u64,
    remove_activation_preserving_args_entry: u64,
    remove_activation_entry: u64,
    throw_array_index_out_of_bounds_entry: u64,
    throw_array_store_entry: u64,
    throw_arithmetic_entry: u64,
    throw_class_cast_entry: u64,
    throw_null_pointer_entry: u64,
    throw_stack_overflow_entry: u64,
    entry_table: [u64; NUMBER_OF_METHOD_ENTRIES],
    normal_table: Box<[u64; DISPATCH_LENGTH * NUMBER_OF_STATES]>,
    wentry_point: [u64; DISPATCH_LENGTH],
    deopt_entry: [[u64; NUMBER_OF_STATES]; NUMBER_OF_DEOPT_ENTRIES],
    deopt_reexecute_return_entry: u64,
}

impl CodeletTable {
    /// A table that classifies every IP as illegal; used until the dump's
    /// interpreter-info record has been replayed.
    pub fn empty() -> Self {
        CodeletTable {
            low_bound: 0,
            high_bound: 0,
            unimplemented_bytecode: 0,
            illegal_bytecode_sequence: 0,
            return_entry: [[0; NUMBER_OF_STATES]; NUMBER_OF_RETURN_ENTRIES],
            invoke_return_entry: [0; NUMBER_OF_RETURN_ADDRS],
            invokeinterface_return_entry: [0; NUMBER_OF_RETURN_ADDRS],
            invokedynamic_return_entry: [0; NUMBER_OF_RETURN_ADDRS],
            native_abi_to_tosca: [0; NUMBER_OF_RESULT_HANDLERS],
            rethrow_exception_entry: 0,
            throw_exception_entry: 0,
            remove_activation_preserving_args_entry: 0,
            remove_activation_entry: 0,
            throw_array_index_out_of_bounds_entry: 0,
            throw_array_store_entry: 0,
            throw_arithmetic_entry: 0,
            throw_class_cast_entry: 0,
            throw_null_pointer_entry: 0,
            throw_stack_overflow_entry: 0,
            entry_table: [0; NUMBER_OF_METHOD_ENTRIES],
            normal_table: Box::new([0; DISPATCH_LENGTH * NUMBER_OF_STATES]),
            wentry_point: [0; DISPATCH_LENGTH],
            deopt_entry: [[0; NUMBER_OF_STATES]; NUMBER_OF_DEOPT_ENTRIES],
            deopt_reexecute_return_entry: 0,
        }
    }

    /// Builds the table from the interpreter-info address slots, in the
    /// canonical slot order.
    pub fn from_slots(slots: &[u64]) -> Result<Self, DecodeError> {
        if slots.len() < CODELET_SLOT_COUNT {
            return Err(DecodeError::Config("interpreter info record too short"));
        }
        let mut table = CodeletTable::empty();
        let mut iter = slots.iter().copied();
        let mut next = || iter.next().unwrap();

        table.low_bound = next();
        table.high_bound = next();
        table.unimplemented_bytecode = next();
        table.illegal_bytecode_sequence = next();
        for row in table.return_entry.iter_mut() {
            for slot in row.iter_mut() {
                *slot = next();
            }
        }
        for slot in table.invoke_return_entry.iter_mut() {
            *slot = next();
        }
        for slot in table.invokeinterface_return_entry.iter_mut() {
            *slot = next();
        }
        for slot in table.invokedynamic_return_entry.iter_mut() {
            *slot = next();
        }
        for slot in table.native_abi_to_tosca.iter_mut() {
            *slot = next();
        }
        table.rethrow_exception_entry = next();
        table.throw_exception_entry = next();
        table.remove_activation_preserving_args_entry = next();
        table.remove_activation_entry = next();
        table.throw_array_index_out_of_bounds_entry = next();
        table.throw_array_store_entry = next();
        table.throw_arithmetic_entry = next();
        table.throw_class_cast_entry = next();
        table.throw_null_pointer_entry = next();
        table.throw_stack_overflow_entry = next();
        for slot in table.entry_table.iter_mut() {
            *slot = next();
        }
        for slot in table.normal_table.iter_mut() {
            *slot = next();
        }
        for slot in table.wentry_point.iter_mut() {
            *slot = next();
        }
        for row in table.deopt_entry.iter_mut() {
            for slot in row.iter_mut() {
                *slot = next();
            }
        }
        table.deopt_reexecute_return_entry = next();

        debug_assert!(
            table.normal_table.windows(2).all(|w| w[0] <= w[1]),
            "normal_table must be non-decreasing"
        );
        debug_assert!(
            table.wentry_point.windows(2).all(|w| w[0] <= w[1]),
            "wentry_point must be non-decreasing"
        );
        Ok(table)
    }

    fn normal_at(&self, index: usize) -> u64 {
        self.normal_table[index]
    }

    /// Maps an instruction pointer to the codelet it belongs to.
    pub fn classify(&self, ip: u64) -> Codelet {
        if ip < self.low_bound || ip >= self.high_bound {
            return Codelet::Illegal;
        }

        if ip >= self.normal_at(0) && ip < self.wentry_point[0] {
            let mut low = 0isize;
            let mut high = (DISPATCH_LENGTH * NUMBER_OF_STATES) as isize - 1;
            while low <= high {
                let mid = (low + high) / 2;
                let addr = self.normal_at(mid as usize);
                if addr == ip {
                    return Codelet::Bytecode(Bytecode((mid as usize / NUMBER_OF_STATES) as u8));
                } else if addr > ip {
                    high = mid - 1;
                } else {
                    low = mid + 1;
                }
            }
            return Codelet::Illegal;
        }

        if ip >= self.wentry_point[0] && ip < self.deopt_entry[0][0] {
            let mut low = 0isize;
            let mut high = DISPATCH_LENGTH as isize - 1;
            while low <= high {
                let mid = (low + high) / 2;
                let addr = self.wentry_point[mid as usize];
                if addr == ip {
                    return Codelet::Bytecode(Bytecode(mid as u8));
                } else if addr > ip {
                    high = mid - 1;
                } else {
                    low = mid + 1;
                }
            }
            return Codelet::Illegal;
        }

        if ip < self.unimplemented_bytecode {
            return Codelet::Illegal;
        }
        if ip == self.unimplemented_bytecode {
            return Codelet::UnimplementedBytecode;
        }
        if ip == self.illegal_bytecode_sequence {
            return Codelet::IllegalBytecodeSequence;
        }
        if ip >= self.return_entry[0][0] && ip < self.invoke_return_entry[0] {
            return Codelet::Return;
        }
        if ip >= self.invoke_return_entry[0] && ip < self.invokeinterface_return_entry[0] {
            return Codelet::InvokeReturn;
        }
        if ip >= self.invokeinterface_return_entry[0] && ip < self.invokedynamic_return_entry[0] {
            return Codelet::InvokeinterfaceReturn;
        }
        if ip >= self.invokedynamic_return_entry[0] && ip < self.native_abi_to_tosca[0] {
            return Codelet::InvokedynamicReturn;
        }
        if ip >= self.native_abi_to_tosca[0] && ip < self.rethrow_exception_entry {
            return Codelet::ResultHandler;
        }
        if ip >= self.entry_table[0] && ip < self.normal_at(0) {
            return Codelet::MethodEntry;
        }
        if ip >= self.deopt_entry[0][0] && ip < self.deopt_reexecute_return_entry {
            return Codelet::Deopt;
        }
        if ip == self.rethrow_exception_entry {
            return Codelet::RethrowException;
        }
        if ip == self.throw_exception_entry {
            return Codelet::ThrowException;
        }
        if ip == self.remove_activation_preserving_args_entry {
            return Codelet::RemoveActivationPreservingArgs;
        }
        if ip == self.remove_activation_entry {
            return Codelet::RemoveActivation;
        }
        if ip == self.throw_array_index_out_of_bounds_entry {
            return Codelet::ThrowArrayIndexOutOfBounds;
        }
        if ip == self.throw_array_store_entry {
            return Codelet::ThrowArrayStore;
        }
        if ip == self.throw_arithmetic_entry {
            return Codelet::ThrowArithmetic;
        }
        if ip == self.throw_class_cast_entry {
            return Codelet::ThrowClassCast;
        }
        if ip == self.throw_null_pointer_entry {
            return Codelet::ThrowNullPointer;
        }
        if ip == self.throw_stack_overflow_entry {
            return Codelet::ThrowStackOverflow;
        }
        if ip == self.deopt_reexecute_return_entry {
            return Codelet::DeoptReexecuteReturn;
        }

        Codelet::Illegal
    }
}
