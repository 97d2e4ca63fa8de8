// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloc::format;
use core::fmt::Debug;

use super::GeneralRegisters;

/// The general-purpose registers an exit handler changed, printed as
/// `name: old -> new` pairs.
pub struct GeneralRegistersDiff {
    before: GeneralRegisters,
    after: GeneralRegisters,
}

impl GeneralRegistersDiff {
    const RSP_INDEX: u8 = 4;

    pub fn new(before: GeneralRegisters, after: GeneralRegisters) -> Self {
        Self { before, after }
    }

    /// Returns `true` if nothing changed.
    pub fn is_same(&self) -> bool {
        self.before == self.after
    }

    /// Iterates the encoding indices of the registers that changed.
    pub fn changed(&self) -> impl Iterator<Item = u8> + '_ {
        (0..16u8)
            .filter(|&i| i != Self::RSP_INDEX)
            .filter(|&i| self.before.get_reg_of_index(i) != self.after.get_reg_of_index(i))
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("GeneralRegistersDiff");
        for i in self.changed() {
            debug.field(
                GeneralRegisters::register_name(i),
                &format!(
                    "{:#x} -> {:#x}",
                    self.before.get_reg_of_index(i),
                    self.after.get_reg_of_index(i)
                ),
            );
        }
        debug.finish()
    }
}
