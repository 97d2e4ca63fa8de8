mod diff;

pub use diff::GeneralRegistersDiff;

/// General-purpose registers of the guest, saved and restored by the entry
/// path around every `VMLAUNCH`/`VMRESUME`.
///
/// `RSP` lives in the VMCS, the slot at index 4 only keeps the layout in the
/// hardware encoding order.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

macro_rules! define_reg_getter_setters {
    ($($reg:ident => $r32:ident, $r16:ident, $r8:ident;)+) => {
        paste::paste! {
            $(
                #[doc = concat!("Returns the low 32 bits of `", stringify!($reg), "`.")]
                pub const fn $r32(&self) -> u32 {
                    self.$reg as u32
                }

                #[doc = concat!("Writes `", stringify!($r32), "`, zero-extending into `", stringify!($reg), "`.")]
                pub fn [<set_ $r32>](&mut self, value: u32) {
                    self.$reg = value as u64;
                }

                pub const fn $r16(&self) -> u16 {
                    self.$reg as u16
                }

                pub fn [<set_ $r16>](&mut self, value: u16) {
                    self.$reg = (self.$reg & !0xffff) | value as u64;
                }

                pub const fn $r8(&self) -> u8 {
                    self.$reg as u8
                }

                pub fn [<set_ $r8>](&mut self, value: u8) {
                    self.$reg = (self.$reg & !0xff) | value as u64;
                }
            )+
        }
    };
}

macro_rules! define_high_byte_getter_setters {
    ($($reg:ident => $h8:ident;)+) => {
        paste::paste! {
            $(
                pub const fn $h8(&self) -> u8 {
                    (self.$reg >> 8) as u8
                }

                pub fn [<set_ $h8>](&mut self, value: u8) {
                    self.$reg = (self.$reg & !0xff00) | ((value as u64) << 8);
                }
            )+
        }
    };
}

impl GeneralRegisters {
    /// Register names in encoding order.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with the given encoding index.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the register with the given encoding index.
    ///
    /// # Panics
    ///
    /// Panics on index 4 (`rsp`, kept in the VMCS) and on indices above 15.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// Sets the register with the given encoding index.
    ///
    /// # Panics
    ///
    /// Same as [`GeneralRegisters::get_reg_of_index`].
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// Returns `EDX:EAX` as one 64-bit value.
    pub const fn get_edx_eax(&self) -> u64 {
        ((self.rdx as u32 as u64) << 32) | (self.rax as u32 as u64)
    }

    define_reg_getter_setters! {
        rax => eax, ax, al;
        rcx => ecx, cx, cl;
        rdx => edx, dx, dl;
        rbx => ebx, bx, bl;
        rbp => ebp, bp, bpl;
        rsi => esi, si, sil;
        rdi => edi, di, dil;
        r8 => r8d, r8w, r8b;
        r9 => r9d, r9w, r9b;
        r10 => r10d, r10w, r10b;
        r11 => r11d, r11w, r11b;
        r12 => r12d, r12w, r12b;
        r13 => r13d, r13w, r13b;
        r14 => r14d, r14w, r14b;
        r15 => r15d, r15w, r15b;
    }

    define_high_byte_getter_setters! {
        rax => ah;
        rcx => ch;
        rdx => dh;
        rbx => bh;
    }
}

/// Pushes the guest registers onto the stack, in reverse so that the stack
/// pointer ends up pointing at a [`GeneralRegisters`].
macro_rules! save_regs_to_stack {
    () => {
        "
        push r15
        push r14
        push r13
        push r12
        push r11
        push r10
        push r9
        push r8
        push rdi
        push rsi
        push rbp
        sub rsp, 8
        push rbx
        push rdx
        push rcx
        push rax"
    };
}

/// Pops a [`GeneralRegisters`] from the stack into the registers.
macro_rules! restore_regs_from_stack {
    () => {
        "
        pop rax
        pop rcx
        pop rdx
        pop rbx
        add rsp, 8
        pop rbp
        pop rsi
        pop rdi
        pop r8
        pop r9
        pop r10
        pop r11
        pop r12
        pop r13
        pop r14
        pop r15"
    };
}
