//! Study-Root C-FIND SCU used for study and series discovery.

use crate::dimse::find_req_command;
use crate::types::{CalledAETitle, OurAETitle};
use anyhow::{Context, bail};
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::{TransferSyntaxRegistry, entries};
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{ClientAssociationOptions, Pdu};
use std::io::Read;
use std::time::Duration;

pub(crate) struct FindScu<'a> {
    pub(crate) pacs_address: &'a str,
    pub(crate) aec: &'a CalledAETitle,
    pub(crate) aet: &'a OurAETitle,
    pub(crate) acse_timeout: Duration,
    pub(crate) dimse_timeout: Duration,
}

impl FindScu<'_> {
    /// Run one C-FIND query and collect every identifier returned with a
    /// Pending status (0xFF00/0xFF01).
    ///
    /// An empty result is not an error; callers decide whether "no match"
    /// matters.
    pub(crate) fn query(
        &self,
        identifier: InMemDicomObject,
    ) -> anyhow::Result<Vec<InMemDicomObject>> {
        let abstract_syntax = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
        let scu_opt = ClientAssociationOptions::new()
            .with_abstract_syntax(abstract_syntax)
            .calling_ae_title(self.aet.as_str())
            .called_ae_title(self.aec.as_str())
            .max_pdu_length(16384)
            .connection_timeout(self.acse_timeout)
            .read_timeout(self.dimse_timeout);
        let mut scu = scu_opt.establish_with(self.pacs_address)?;
        let pc_selected = scu
            .presentation_contexts()
            .first()
            .context("Could not select presentation context")?;
        let pc_selected_id = pc_selected.id;
        let ts = TransferSyntaxRegistry
            .get(&pc_selected.transfer_syntax)
            .context("Poorly negotiated transfer syntax")?;
        let cmd = find_req_command(abstract_syntax, 1);
        let mut cmd_data = Vec::with_capacity(128);
        cmd.write_dataset_with_ts(&mut cmd_data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context("Failed to write command")?;
        let mut iod_data = Vec::with_capacity(128);
        identifier
            .write_dataset_with_ts(&mut iod_data, ts)
            .context("failed to write identifier dataset")?;
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_selected_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        };
        scu.send(&pdu).context("Could not send command")?;
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_selected_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: iod_data,
            }],
        };
        scu.send(&pdu).context("Could not send C-FIND request")?;

        let mut matches: Vec<InMemDicomObject> = Default::default();
        loop {
            let rsp_pdu = scu
                .receive()
                .context("Failed to receive response from remote node")?;

            match rsp_pdu {
                Pdu::PData { data } => {
                    let data_value = &data[0];

                    let cmd_obj = InMemDicomObject::read_dataset_with_ts(
                        &data_value.data[..],
                        &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                    )?;
                    let status = cmd_obj
                        .get(tags::STATUS)
                        .context("status code from response is missing")?
                        .to_int::<i64>()
                        .context("failed to read status code")?;
                    if status == 0 {
                        break;
                    } else if status == 0xFF00 || status == 0xFF01 {
                        // fetch the identifier data set of this match
                        let dcm = {
                            let mut rsp = scu.receive_pdata();
                            let mut response_data = Vec::new();
                            rsp.read_to_end(&mut response_data)
                                .context("Failed to read response data")?;

                            InMemDicomObject::read_dataset_with_ts(&response_data[..], ts)
                                .context("Could not read response data set")?
                        };

                        // some implementations report status code 0 on the
                        // data set PDU instead of a separate final response
                        let status = dcm
                            .get(tags::STATUS)
                            .map(|ele| ele.to_int::<u16>())
                            .transpose()
                            .context("failed to read status code")?
                            .unwrap_or(0);

                        matches.push(dcm);

                        if status == 0 {
                            break;
                        }
                    } else {
                        tracing::warn!(
                            pacs_address = self.pacs_address,
                            aec = self.aec.as_str(),
                            status = format!("0x{status:04X}"),
                            "C-FIND operation failed"
                        );
                        break;
                    }
                }

                pdu @ Pdu::Unknown { .. }
                | pdu @ Pdu::AssociationRQ { .. }
                | pdu @ Pdu::AssociationAC { .. }
                | pdu @ Pdu::AssociationRJ { .. }
                | pdu @ Pdu::ReleaseRQ
                | pdu @ Pdu::ReleaseRP
                | pdu @ Pdu::AbortRQ { .. } => {
                    let _ = scu.abort();
                    tracing::error!("Unexpected SCP response: {:?}", pdu);
                    bail!("Unexpected SCP response")
                }
            }
        }
        let _ = scu.release();
        Ok(matches)
    }
}
