// Models -----------------------------------------------------------------------------------------

///
/// Closed set of supported MCU boards.
///
/// `Generic` and `Teensy` are sentinels: `Generic` is used for catch-all serial devices and
/// for boards whose class has not narrowed the model yet, `Teensy` means "some Teensy" before
/// a concrete model is known. Everything else names a real board.
///
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Model {
    Generic,
    Teensy,
    TeensyPp10,
    Teensy20,
    TeensyPp20,
    Teensy30,
    Teensy31,
    TeensyLc,
    Teensy32,
    Teensy35,
    Teensy36,
    Teensy40Beta1,
    Teensy40,
}

struct ModelInfo {
    model: Model,
    name: &'static str,
    mcu: Option<&'static str>,
}

static MODELS: [ModelInfo; 13] = [
    ModelInfo { model: Model::Generic, name: "Generic", mcu: None },
    ModelInfo { model: Model::Teensy, name: "Teensy", mcu: None },
    ModelInfo { model: Model::TeensyPp10, name: "Teensy++ 1.0", mcu: Some("at90usb646") },
    ModelInfo { model: Model::Teensy20, name: "Teensy 2.0", mcu: Some("atmega32u4") },
    ModelInfo { model: Model::TeensyPp20, name: "Teensy++ 2.0", mcu: Some("at90usb1286") },
    ModelInfo { model: Model::Teensy30, name: "Teensy 3.0", mcu: Some("mk20dx128") },
    ModelInfo { model: Model::Teensy31, name: "Teensy 3.1", mcu: Some("mk20dx256") },
    ModelInfo { model: Model::TeensyLc, name: "Teensy LC", mcu: Some("mkl26z64") },
    ModelInfo { model: Model::Teensy32, name: "Teensy 3.2", mcu: Some("mk20dx256") },
    ModelInfo { model: Model::Teensy35, name: "Teensy 3.5", mcu: Some("mk64fx512") },
    ModelInfo { model: Model::Teensy36, name: "Teensy 3.6", mcu: Some("mk66fx1m0") },
    ModelInfo { model: Model::Teensy40Beta1, name: "Teensy 4.0 (beta 1)", mcu: Some("imxrt") },
    ModelInfo { model: Model::Teensy40, name: "Teensy 4.0", mcu: Some("imxrt") },
];

impl Model {
    fn info(self) -> &'static ModelInfo {
        MODELS.iter().find(|info| info.model == self).unwrap()
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn mcu(self) -> Option<&'static str> {
        self.info().mcu
    }

    /// A real board model, as opposed to the Generic/Teensy sentinels.
    pub fn is_real(self) -> bool {
        self.info().mcu.is_some()
    }

    pub fn find(name: &str) -> Option<Model> {
        MODELS.iter().find(|info| info.name == name).map(|info| info.model)
    }

    /// All models, sentinels included, in display order.
    pub fn all() -> impl Iterator<Item = Model> {
        MODELS.iter().map(|info| info.model)
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
