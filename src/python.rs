use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use tokio::runtime::Runtime;

use crate::assembler::Endianness;
use crate::config::{BleConfig, DriverConfig, SerialConfig};
use crate::driver::MicroNir;
use crate::errors::DriverError;
use crate::logging::{self, LogSink};
use crate::protocol::Dialect;
use crate::spectrum::{self, Spectrum, PIXEL_COUNT};

fn runtime_error(e: DriverError) -> PyErr {
    PyErr::new::<PyRuntimeError, _>(e.to_string())
}

/// Wrap a Python callable as a log sink. Exceptions raised by the callable
/// are swallowed so logging can never break an acquisition.
fn py_sink(callback: Py<PyAny>) -> LogSink {
    LogSink::new(move |line| {
        Python::attach(|py| {
            let _ = callback.call1(py, (line,));
        })
    })
}

/// One 128-pixel spectrum.
///
/// Attributes:
///     raw: Raw 16-bit samples.
///     wavelengths: Wavelength of each pixel in nm (900-1700).
///     intensities: Normalized intensities in [0, 1].
#[pyclass(name = "Spectrum", frozen, eq)]
#[derive(Clone, PartialEq)]
struct PySpectrum {
    #[pyo3(get)]
    raw: Vec<u16>,
    #[pyo3(get)]
    wavelengths: Vec<u16>,
    #[pyo3(get)]
    intensities: Vec<f64>,
}

#[pymethods]
impl PySpectrum {
    fn __repr__(&self) -> String {
        let peak = self.raw.iter().copied().max().unwrap_or(0);
        format!("Spectrum(pixels={}, peak_raw={})", self.raw.len(), peak)
    }

    fn __len__(&self) -> usize {
        self.raw.len()
    }

    /// Convert to dictionary for easy serialization.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("raw", self.raw.clone())?;
        dict.set_item("wavelengths", self.wavelengths.clone())?;
        dict.set_item("intensities", self.intensities.clone())?;
        Ok(dict)
    }
}

impl From<Spectrum> for PySpectrum {
    fn from(s: Spectrum) -> Self {
        PySpectrum {
            raw: s.raw().to_vec(),
            wavelengths: s.wavelengths(),
            intensities: s.intensities(),
        }
    }
}

/// MicroNIR spectrometer driver.
///
/// Example:
///     >>> nir = MicroNir(port="/dev/ttyUSB0", logger=print)
///     >>> print(nir.connect())
///     >>> spectrum = nir.scan()
///     >>> nir.disconnect()
#[pyclass(name = "MicroNir")]
struct PyMicroNir {
    rt: Runtime,
    inner: Arc<MicroNir>,
}

#[pymethods]
impl PyMicroNir {
    /// Create a driver.
    ///
    /// Args:
    ///     transport: "serial" (default) or "ble". Ignored when `config` is given.
    ///     port: Serial port path; auto-detected by USB vendor id when omitted.
    ///     config: Path to a TOML configuration file.
    ///     endianness: "le" or "be" sample byte order.
    ///     dialect: "ascii", "framed", "binary" or "binary-etx".
    ///     logger: Callable receiving one diagnostic line per call.
    #[new]
    #[pyo3(signature = (transport="serial", port=None, config=None, endianness=None, dialect=None, logger=None))]
    fn new(
        transport: &str,
        port: Option<String>,
        config: Option<String>,
        endianness: Option<&str>,
        dialect: Option<&str>,
        logger: Option<Py<PyAny>>,
    ) -> PyResult<Self> {
        let mut cfg = match (config, transport) {
            (Some(path), _) => DriverConfig::load(path).map_err(runtime_error)?,
            (None, "serial") => {
                let serial = match port {
                    Some(port) => SerialConfig::default().with_port(port),
                    None => SerialConfig::default(),
                };
                DriverConfig::serial(serial)
            }
            (None, "ble") => DriverConfig::ble(BleConfig::default()),
            (None, other) => {
                return Err(PyErr::new::<PyValueError, _>(format!(
                    "unknown transport '{other}' (expected 'serial' or 'ble')"
                )))
            }
        };
        if let Some(e) = endianness {
            let e: Endianness = e.parse().map_err(PyErr::new::<PyValueError, _>)?;
            cfg = cfg.with_endianness(e);
        }
        if let Some(d) = dialect {
            let d: Dialect = d.parse().map_err(PyErr::new::<PyValueError, _>)?;
            cfg = cfg.with_dialect(d);
        }

        let rt = Runtime::new()
            .map_err(|e| PyErr::new::<PyRuntimeError, _>(format!("tokio runtime init failed: {e}")))?;
        Ok(PyMicroNir {
            rt,
            inner: Arc::new(MicroNir::new(cfg, logger.map(py_sink))),
        })
    }

    /// Replace the log callable. `None` keeps only the Rust logger.
    #[pyo3(signature = (logger=None))]
    fn set_logger(&self, logger: Option<Py<PyAny>>) {
        self.inner.set_log_sink(logger.map(py_sink));
    }

    /// Negotiate a link.
    ///
    /// Returns:
    ///     Dict with `name`, `link` and `status` ("CONNECTED" or "CONNECTED_FORCED").
    ///
    /// Raises:
    ///     ConnectionError: If no link could be established at all.
    fn connect<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let info = py
            .detach(|| self.rt.block_on(self.inner.connect()))
            .map_err(|e| PyErr::new::<PyConnectionError, _>(e.to_string()))?;
        let dict = PyDict::new(py);
        dict.set_item("name", info.display_name)?;
        dict.set_item("link", info.descriptor.to_string())?;
        dict.set_item("status", info.status.to_string())?;
        Ok(dict)
    }

    fn disconnect(&self, py: Python<'_>) {
        py.detach(|| self.rt.block_on(self.inner.disconnect()))
    }

    #[getter]
    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Acquire one spectrum; `None` on timeout or link loss.
    ///
    /// Raises:
    ///     RuntimeError: If another operation is in flight.
    fn scan(&self, py: Python<'_>) -> PyResult<Option<PySpectrum>> {
        py.detach(|| self.rt.block_on(self.inner.scan()))
            .map(|s| s.map(PySpectrum::from))
            .map_err(runtime_error)
    }

    fn set_lamp(&self, py: Python<'_>, on: bool) -> PyResult<bool> {
        py.detach(|| self.rt.block_on(self.inner.set_lamp(on)))
            .map_err(runtime_error)
    }

    fn warm_up(&self, py: Python<'_>) -> PyResult<bool> {
        py.detach(|| self.rt.block_on(self.inner.warm_up()))
            .map_err(runtime_error)
    }

    /// Ask for the firmware version; the reply goes to the logger.
    fn get_system_info(&self, py: Python<'_>) -> PyResult<()> {
        py.detach(|| self.rt.block_on(self.inner.get_system_info()))
            .map_err(runtime_error)
    }

    /// Listen passively and log whatever arrives.
    #[pyo3(signature = (seconds=3.0))]
    fn sniff(&self, py: Python<'_>, seconds: f64) -> PyResult<bool> {
        let window = Duration::try_from_secs_f64(seconds)
            .map_err(|e| PyErr::new::<PyValueError, _>(e.to_string()))?;
        py.detach(|| self.rt.block_on(self.inner.sniff(window)))
            .map_err(runtime_error)
    }

    fn dark_reference(&self, py: Python<'_>) -> PyResult<Option<PySpectrum>> {
        py.detach(|| self.rt.block_on(self.inner.dark_reference()))
            .map(|s| s.map(PySpectrum::from))
            .map_err(runtime_error)
    }

    fn white_reference(&self, py: Python<'_>) -> PyResult<Option<PySpectrum>> {
        py.detach(|| self.rt.block_on(self.inner.white_reference()))
            .map(|s| s.map(PySpectrum::from))
            .map_err(runtime_error)
    }

    fn __repr__(&self) -> String {
        match self.inner.connection_info() {
            Some(info) => format!("MicroNir({}, {})", info.display_name, info.status),
            None => "MicroNir(disconnected)".to_string(),
        }
    }
}

/// Wavelength in nm of pixel `index`.
#[pyfunction]
fn wavelength_nm(index: usize) -> PyResult<u16> {
    if index >= PIXEL_COUNT {
        return Err(PyErr::new::<PyValueError, _>(format!(
            "pixel index {index} out of range 0..{PIXEL_COUNT}"
        )));
    }
    Ok(spectrum::wavelength_nm(index))
}

#[pymodule]
fn micronir(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_rust_logging();
    m.add_class::<PyMicroNir>()?;
    m.add_class::<PySpectrum>()?;
    m.add_function(wrap_pyfunction!(wavelength_nm, m)?)?;

    m.add("PIXEL_COUNT", PIXEL_COUNT)?;
    m.add("FRAME_BYTES", crate::assembler::FRAME_BYTES)?;

    Ok(())
}
