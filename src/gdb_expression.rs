//! The debugger has a simple bytecode language for expressions to be
//! evaluated in the remote target; breakpoint conditions arrive as such
//! programs. This is an evaluator for the subset a condition can use:
//! a big-endian-encoded stack machine with constants, arithmetic, register
//! fetches, sized memory loads and jumps.

use crate::gdb_register::GdbRegister;
use crate::registers::MAX_REG_SIZE_BYTES;
use crate::session::address_space::AddressSpace;
use crate::session::task::Task;

#[allow(non_upper_case_globals)]
#[allow(dead_code)]
mod op {
    pub const OP_float: u8 = 0x01;
    pub const OP_add: u8 = 0x02;
    pub const OP_sub: u8 = 0x03;
    pub const OP_mul: u8 = 0x04;
    pub const OP_div_signed: u8 = 0x05;
    pub const OP_div_unsigned: u8 = 0x06;
    pub const OP_rem_signed: u8 = 0x07;
    pub const OP_rem_unsigned: u8 = 0x08;
    pub const OP_lsh: u8 = 0x09;
    pub const OP_rsh_signed: u8 = 0x0a;
    pub const OP_rsh_unsigned: u8 = 0x0b;
    pub const OP_log_not: u8 = 0x0e;
    pub const OP_bit_and: u8 = 0x0f;
    pub const OP_bit_or: u8 = 0x10;
    pub const OP_bit_xor: u8 = 0x11;
    pub const OP_bit_not: u8 = 0x12;
    pub const OP_equal: u8 = 0x13;
    pub const OP_less_signed: u8 = 0x14;
    pub const OP_less_unsigned: u8 = 0x15;
    pub const OP_ext: u8 = 0x16;
    pub const OP_ref8: u8 = 0x17;
    pub const OP_ref16: u8 = 0x18;
    pub const OP_ref32: u8 = 0x19;
    pub const OP_ref64: u8 = 0x1a;
    pub const OP_if_goto: u8 = 0x20;
    pub const OP_goto: u8 = 0x21;
    pub const OP_const8: u8 = 0x22;
    pub const OP_const16: u8 = 0x23;
    pub const OP_const32: u8 = 0x24;
    pub const OP_const64: u8 = 0x25;
    pub const OP_reg: u8 = 0x26;
    pub const OP_end: u8 = 0x27;
    pub const OP_dup: u8 = 0x28;
    pub const OP_pop: u8 = 0x29;
    pub const OP_zero_ext: u8 = 0x2a;
    pub const OP_swap: u8 = 0x2b;
    pub const OP_pick: u8 = 0x32;
    pub const OP_rot: u8 = 0x33;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct GdbExpressionValue {
    pub i: i64,
}

impl GdbExpressionValue {
    pub fn new(i: i64) -> GdbExpressionValue {
        GdbExpressionValue { i }
    }
}

type Value = GdbExpressionValue;

pub struct GdbExpression {
    bytecode: Vec<u8>,
}

impl GdbExpression {
    pub fn new(data: &[u8]) -> GdbExpression {
        GdbExpression {
            bytecode: data.to_owned(),
        }
    }

    /// If evaluation succeeds, store the final result in `result` and
    /// return true. Otherwise return false.
    pub fn evaluate(&self, t: &Task, vm: &AddressSpace, result: &mut Value) -> bool {
        let mut state = ExpressionState::new(&self.bytecode);
        let mut steps = 0usize;
        while !state.end {
            if steps >= 10000 || state.error {
                return false;
            }
            state.step(t, vm);
            steps += 1;
        }
        let v = state.pop();
        if state.error {
            return false;
        }
        *result = v;
        true
    }
}

struct BinaryOperands {
    a: i64,
    b: i64,
}

struct ExpressionState<'a> {
    bytecode: &'a [u8],
    stack: Vec<Value>,
    pc: usize,
    error: bool,
    end: bool,
}

impl<'a> ExpressionState<'a> {
    fn new(bytecode: &[u8]) -> ExpressionState {
        ExpressionState {
            bytecode,
            stack: Vec::new(),
            pc: 0,
            error: false,
            end: false,
        }
    }

    fn set_error(&mut self) {
        self.error = true;
    }

    // These return a sentinel and set `error` when the program is bad; the
    // driving loop bails out before the sentinel can matter.

    fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => {
                self.set_error();
                Value::new(-1)
            }
        }
    }

    fn pop_a(&mut self) -> i64 {
        self.pop().i
    }

    fn pop_a_b(&mut self) -> BinaryOperands {
        let b = self.pop().i;
        BinaryOperands { a: self.pop().i, b }
    }

    /// Divisors must not be zero.
    fn nonzero(&mut self, v: i64) -> i64 {
        if v == 0 {
            self.set_error();
            return 1;
        }
        v
    }

    fn push(&mut self, i: i64) {
        self.stack.push(Value::new(i));
    }

    fn fetch(&mut self, num_bytes: usize) -> u64 {
        if self.pc + num_bytes > self.bytecode.len() {
            self.set_error();
            return 0;
        }
        let mut v: u64 = 0;
        for i in 0..num_bytes {
            v = (v << 8) | u64::from(self.bytecode[self.pc + i]);
        }
        self.pc += num_bytes;
        v
    }

    fn load(&mut self, vm: &AddressSpace, num_bytes: usize) {
        let addr = self.pop().i as usize;
        if self.error {
            // Don't touch memory if we're already in an error state.
            return;
        }
        let mut buf = [0u8; 8];
        if vm.read_bytes_fallible(addr.into(), &mut buf[0..num_bytes]) != num_bytes {
            self.set_error();
            return;
        }
        let mut v: u64 = 0;
        for i in (0..num_bytes).rev() {
            v = (v << 8) | u64::from(buf[i]);
        }
        self.push(v as i64);
    }

    fn fetch_register(&mut self, t: &Task) {
        let regname = GdbRegister::nth(self.fetch(2) as u32);
        if self.error {
            return;
        }
        let mut buf = [0u8; MAX_REG_SIZE_BYTES];
        let maybe_size = t
            .regs()
            .read_register(&mut buf, regname)
            .or_else(|| t.extra_regs().read_register(&mut buf, regname));
        match maybe_size {
            Some(size) if size <= 8 => {
                let mut v: u64 = 0;
                for i in (0..size).rev() {
                    v = (v << 8) | u64::from(buf[i]);
                }
                self.push(v as i64);
            }
            _ => self.set_error(),
        }
    }

    fn pick(&mut self, offset: usize) {
        if offset >= self.stack.len() {
            self.set_error();
            return;
        }
        self.push(self.stack[self.stack.len() - 1 - offset].i);
    }

    fn step(&mut self, t: &Task, vm: &AddressSpace) {
        debug_assert!(!self.error);
        use self::op::*;
        match self.fetch(1) as u8 {
            OP_add => {
                let ops = self.pop_a_b();
                self.push(ops.a.wrapping_add(ops.b))
            }
            OP_sub => {
                let ops = self.pop_a_b();
                self.push(ops.a.wrapping_sub(ops.b))
            }
            OP_mul => {
                let ops = self.pop_a_b();
                self.push(ops.a.wrapping_mul(ops.b))
            }
            OP_div_signed => {
                let ops = self.pop_a_b();
                let d = self.nonzero(ops.b);
                self.push(ops.a.wrapping_div(d))
            }
            OP_div_unsigned => {
                let ops = self.pop_a_b();
                let d = self.nonzero(ops.b) as u64;
                self.push((ops.a as u64 / d) as i64)
            }
            OP_rem_signed => {
                let ops = self.pop_a_b();
                let d = self.nonzero(ops.b);
                self.push(ops.a.wrapping_rem(d))
            }
            OP_rem_unsigned => {
                let ops = self.pop_a_b();
                let d = self.nonzero(ops.b) as u64;
                self.push((ops.a as u64 % d) as i64)
            }
            OP_lsh => {
                let ops = self.pop_a_b();
                self.push(ops.a.wrapping_shl(ops.b as u32))
            }
            OP_rsh_signed => {
                let ops = self.pop_a_b();
                self.push(ops.a.wrapping_shr(ops.b as u32))
            }
            OP_rsh_unsigned => {
                let ops = self.pop_a_b();
                self.push((ops.a as u64).wrapping_shr(ops.b as u32) as i64)
            }
            OP_log_not => {
                let a = self.pop_a();
                self.push((a == 0) as i64)
            }
            OP_bit_and => {
                let ops = self.pop_a_b();
                self.push(ops.a & ops.b)
            }
            OP_bit_or => {
                let ops = self.pop_a_b();
                self.push(ops.a | ops.b)
            }
            OP_bit_xor => {
                let ops = self.pop_a_b();
                self.push(ops.a ^ ops.b)
            }
            OP_bit_not => {
                let a = self.pop_a();
                self.push(!a)
            }
            OP_equal => {
                let ops = self.pop_a_b();
                self.push((ops.a == ops.b) as i64)
            }
            OP_less_signed => {
                let ops = self.pop_a_b();
                self.push((ops.a < ops.b) as i64)
            }
            OP_less_unsigned => {
                let ops = self.pop_a_b();
                self.push(((ops.a as u64) < ops.b as u64) as i64)
            }
            OP_ext => {
                let n = self.fetch(1) as u32;
                let a = self.pop_a();
                if n == 0 || n > 64 {
                    self.set_error();
                } else if n < 64 {
                    let shift = 64 - n;
                    self.push(a.wrapping_shl(shift).wrapping_shr(shift))
                } else {
                    self.push(a)
                }
            }
            OP_zero_ext => {
                let n = self.fetch(1) as u32;
                let a = self.pop_a();
                if n == 0 || n > 64 {
                    self.set_error();
                } else if n < 64 {
                    self.push((a as u64 & ((1u64 << n) - 1)) as i64)
                } else {
                    self.push(a)
                }
            }
            OP_ref8 => self.load(vm, 1),
            OP_ref16 => self.load(vm, 2),
            OP_ref32 => self.load(vm, 4),
            OP_ref64 => self.load(vm, 8),
            OP_if_goto => {
                let target = self.fetch(2) as usize;
                let a = self.pop_a();
                if a != 0 {
                    self.pc = target;
                }
            }
            OP_goto => {
                let target = self.fetch(2) as usize;
                self.pc = target;
            }
            OP_const8 => {
                let v = self.fetch(1);
                self.push(v as i64)
            }
            OP_const16 => {
                let v = self.fetch(2);
                self.push(v as i64)
            }
            OP_const32 => {
                let v = self.fetch(4);
                self.push(v as i64)
            }
            OP_const64 => {
                let v = self.fetch(8);
                self.push(v as i64)
            }
            OP_reg => self.fetch_register(t),
            OP_end => self.end = true,
            OP_dup => self.pick(0),
            OP_pop => {
                self.pop();
            }
            OP_swap => {
                let ops = self.pop_a_b();
                self.push(ops.b);
                self.push(ops.a);
            }
            OP_pick => {
                let n = self.fetch(1) as usize;
                self.pick(n)
            }
            OP_rot => {
                let c = self.pop_a();
                let b = self.pop_a();
                let a = self.pop_a();
                self.push(c);
                self.push(a);
                self.push(b);
            }
            // OP_float and anything else we don't implement.
            _ => self.set_error(),
        }
    }
}
