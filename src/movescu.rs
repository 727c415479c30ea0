//! Study-Root C-MOVE SCU.
//!
//! One association is established per study and reused for every series-level
//! C-MOVE, mirroring how the PACS expects a retrieval session to behave.

use crate::dimse::move_req_command;
use crate::types::{CalledAETitle, OurAETitle};
use anyhow::{Context, bail};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::{TransferSyntaxRegistry, entries};
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::{ClientAssociation, ClientAssociationOptions, Pdu};
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

pub(crate) struct MoveAssociation {
    scu: Option<ClientAssociation<TcpStream>>,
    pc_id: u8,
    transfer_syntax: String,
    destination: OurAETitle,
    msgid: u16,
}

impl MoveAssociation {
    /// Negotiate a Study-Root C-MOVE association with the PACS.
    pub(crate) fn establish(
        pacs_address: &str,
        aec: &CalledAETitle,
        aet: &OurAETitle,
        acse_timeout: Duration,
        dimse_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let scu = ClientAssociationOptions::new()
            .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
            .calling_ae_title(aet.as_str())
            .called_ae_title(aec.as_str())
            .max_pdu_length(16384)
            .connection_timeout(acse_timeout)
            .read_timeout(dimse_timeout)
            .establish_with(pacs_address)?;
        let pc_selected = scu
            .presentation_contexts()
            .first()
            .context("Could not select presentation context")?;
        let pc_id = pc_selected.id;
        let transfer_syntax = pc_selected.transfer_syntax.clone();
        Ok(Self {
            scu: Some(scu),
            pc_id,
            transfer_syntax,
            destination: aet.clone(),
            msgid: 0,
        })
    }

    /// Request the PACS to C-STORE one series to our AE title, blocking until
    /// the terminal status arrives. Returns the DIMSE status word
    /// (0x0000 = success).
    pub(crate) fn move_series(
        &mut self,
        study_instance_uid: &str,
        series_instance_uid: &str,
    ) -> anyhow::Result<u16> {
        self.msgid = self.msgid.wrapping_add(1);
        let ts = TransferSyntaxRegistry
            .get(&self.transfer_syntax)
            .context("Poorly negotiated transfer syntax")?;

        let cmd = move_req_command(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            self.msgid,
            self.destination.as_str(),
        );
        let mut cmd_data = Vec::with_capacity(128);
        cmd.write_dataset_with_ts(&mut cmd_data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context("Failed to write command")?;

        let identifier = series_move_identifier(study_instance_uid, series_instance_uid);
        let mut iod_data = Vec::with_capacity(128);
        identifier
            .write_dataset_with_ts(&mut iod_data, ts)
            .context("failed to write identifier dataset")?;

        let scu = self
            .scu
            .as_mut()
            .context("association already closed")?;
        scu.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: self.pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        })
        .context("Could not send command")?;
        scu.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: self.pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: iod_data,
            }],
        })
        .context("Could not send C-MOVE request")?;

        loop {
            let scu = self
                .scu
                .as_mut()
                .context("association already closed")?;
            let rsp_pdu = scu
                .receive()
                .context("Failed to receive C-MOVE response")?;
            match rsp_pdu {
                Pdu::PData { data } => {
                    let data_value = &data[0];
                    if data_value.value_type != PDataValueType::Command {
                        // a stray identifier fragment; not ours to interpret
                        continue;
                    }
                    let cmd_obj = InMemDicomObject::read_dataset_with_ts(
                        &data_value.data[..],
                        &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                    )?;
                    let status = cmd_obj
                        .get(tags::STATUS)
                        .context("status code from response is missing")?
                        .to_int::<u16>()
                        .context("failed to read status code")?;
                    if status == 0xFF00 {
                        // pending: sub-operations are still running
                        continue;
                    }
                    let data_set_type = cmd_obj
                        .get(tags::COMMAND_DATA_SET_TYPE)
                        .and_then(|ele| ele.to_int::<u16>().ok())
                        .unwrap_or(0x0101);
                    if data_set_type != 0x0101 {
                        // final response carries a failed-SOP list; drain it
                        let mut rsp = self
                            .scu
                            .as_mut()
                            .context("association already closed")?
                            .receive_pdata();
                        let mut sink = Vec::new();
                        let _ = rsp.read_to_end(&mut sink);
                    }
                    return Ok(status);
                }
                pdu => {
                    if let Some(scu) = self.scu.take() {
                        let _ = scu.abort();
                    }
                    tracing::error!("Unexpected SCP response: {:?}", pdu);
                    bail!("Unexpected SCP response")
                }
            }
        }
    }

    pub(crate) fn release(self) {
        if let Some(scu) = self.scu {
            let _ = scu.release();
        }
    }
}

fn series_move_identifier(
    study_instance_uid: &str,
    series_instance_uid: &str,
) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        PrimitiveValue::from("SERIES"),
    ));
    obj.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(study_instance_uid),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(series_instance_uid),
    ));
    obj
}
