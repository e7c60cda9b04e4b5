// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The collaboration tool implementations, one struct per tool.

mod channel;
mod docs;
mod inbox;
mod proposals;
mod resources;
mod status;

pub use channel::{ChannelReadTool, ChannelSendTool};
pub use docs::{
    TeamDocAppendTool, TeamDocCreateTool, TeamDocListTool, TeamDocReadTool, TeamDocWriteTool,
};
pub use inbox::{MyInboxAckTool, MyInboxTool};
pub use proposals::{
    TeamProposalCancelTool, TeamProposalCreateTool, TeamProposalStatusTool, TeamProposalVoteTool,
};
pub use resources::{ResourceCreateTool, ResourceReadTool};
pub use status::{MyStatusSetTool, TeamMembersTool};
