// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library backing the katamaran binary: the QMP monitor client, the host
//! network plumbing (migration tunnel and sch_plug packet buffer), and the
//! source/destination migration orchestrators.

pub mod cmd;
pub mod ctx;
pub mod migrate;
pub mod qdisc;
pub mod qmp;
pub mod tunnel;
