// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{future, future::Future, ops::Deref, sync::Arc};

use bytes::{BufMut as _, Bytes, BytesMut};
use log::debug;

use crate::{
    frame::{ExceptionCode, FunctionCode, Request, SlaveRequest},
    store::RegisterStore,
    Slave,
};

/// A Modbus server service.
pub trait Service {
    /// Requests handled by the service.
    type Request;

    /// Responses sent by the service.
    type Response;

    /// Exceptional responses sent by the service.
    type Exception;

    /// The future response value.
    type Future: Future<Output = Result<Self::Response, Self::Exception>> + Send;

    /// Process the request and return the response asynchronously.
    fn call(&self, req: Self::Request) -> Self::Future;
}

impl<D> Service for D
where
    D: Deref + ?Sized,
    D::Target: Service,
{
    type Request = <D::Target as Service>::Request;
    type Response = <D::Target as Service>::Response;
    type Exception = <D::Target as Service>::Exception;
    type Future = <D::Target as Service>::Future;

    /// A forwarding blanket impl to support smart pointers around [`Service`].
    fn call(&self, req: Self::Request) -> Self::Future {
        self.deref().call(req)
    }
}

/// Serves requests from the register store.
///
/// The response is the payload following the function code: the byte count
/// and register data of a read, or the echoed address and value of a write.
#[derive(Debug, Clone)]
pub struct StoreService {
    store: Arc<RegisterStore>,
}

impl StoreService {
    #[must_use]
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self { store }
    }

    fn handle(&self, req: SlaveRequest) -> Result<Bytes, ExceptionCode> {
        let SlaveRequest { slave, request } = req;
        let slave = Slave(slave);
        match request {
            Request::ReadHoldingRegisters(addr, cnt) | Request::ReadInputRegisters(addr, cnt) => {
                let bank = self.store.bank(slave, request.function_code())?;
                bank.read(addr, cnt)
            }
            Request::WriteSingleRegister(addr, value) => {
                // Single register writes go to the holding registers.
                let bank = self.store.bank(slave, FunctionCode::ReadHoldingRegisters)?;
                bank.write(addr, 1, &value.to_be_bytes())?;
                let mut echo = BytesMut::with_capacity(4);
                echo.put_u16(addr);
                echo.put_u16(value);
                Ok(echo.freeze())
            }
            Request::Custom(code, _) => {
                debug!("Unsupported function {code} for device {slave}");
                Err(self
                    .store
                    .bank(slave, FunctionCode::Custom(code))
                    .err()
                    .unwrap_or(ExceptionCode::IllegalFunction))
            }
        }
    }
}

impl Service for StoreService {
    type Request = SlaveRequest;
    type Response = Bytes;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}
